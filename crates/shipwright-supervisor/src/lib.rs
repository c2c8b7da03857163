//! Autonomous delivery supervisor: the long-running daemon poll loop.
//!
//! Each [`Supervisor::poll_once`] call is one full cycle: preflight auth,
//! pause/backoff checks, candidate polling and triage, spawn/enqueue
//! decisions respecting `max_parallel` and the priority lane, queue
//! drain, reap-and-classify of exited jobs, per-job health checks, and
//! the periodic tasks (config reload, degradation alert, auto-scale,
//! self-optimize, stale reaper, event-log rotation, patrol). The poll
//! loop itself ([`Supervisor::run`]) just sleeps an adaptively-sized
//! interval between cycles and checks the shutdown flag every second
//! while doing so.
//!
//! Bookkeeping that doesn't belong in the persisted [`DaemonState`]
//! (progress histories, the gh rate-limit breaker, nudge-sent flags,
//! cycle counters) lives on [`Supervisor`] itself as a plain value
//! threaded through poll iterations
//! rather than free-floating statics, and gets re-derived from scratch
//! on daemon restart (the window it loses is the adaptive-poll-interval
//! empty-cycle counter and in-flight progress trend, neither of which
//! is safety-critical to preserve across a restart).

pub mod candidates;
pub mod health;
pub mod launcher;
pub mod paths;
pub mod periodic;
pub mod reap;
pub mod signals;
pub mod spawn;

use std::collections::HashMap;
use std::process::Child;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use chrono::Utc;
use shipwright_adaptive::AdaptiveStore;
use shipwright_autoscale::ScalingInputs;
use shipwright_config::DaemonConfig;
use shipwright_events::EventLog;
use shipwright_memory::{BaselineStore, MemoryStore};
use shipwright_patrol::PatrolContext;
use shipwright_retry::FailureClass;
use shipwright_state::StateStore;
use shipwright_template::{TemplateSelectionInput, QualityMemorySignal};
use shipwright_tracker::{claim_issue, release_claim, with_retry, RateLimitBreaker, TrackerClient};
use shipwright_triage::PriorOutcome;
use shipwright_types::{EventType, FailureHistoryEntry, ProgressHistory, ShipwrightEvent};
use shipwright_worktree::WorktreeManager;
use sysinfo::System;

use crate::candidates::{reorder_for_dependencies, score_all, Candidate};
use crate::health::check_job_health;
use crate::launcher::{
    failure_marker_line, read_log_tail, success_marker_line, WorkerLauncher, WorkerSpec,
};
use crate::paths::Paths;
use crate::reap::{classify_and_plan_retry, determine_success, has_checkpoint, ReapOutcome};
use crate::spawn::{build_job, build_worker_spec, enqueue_entry, is_priority_eligible};

/// Everything the supervisor needs for one run: filesystem layout,
/// config, collaborators. Construct once at `daemon start` time.
pub struct Supervisor<T: TrackerClient, L: WorkerLauncher> {
    pub paths: Paths,
    pub config: DaemonConfig,
    pub tracker: T,
    pub launcher: L,
    pub machine_id: String,

    state: StateStore,
    events_buffer: EventLog,
    memory: MemoryStore,
    baselines: BaselineStore,
    adaptive: AdaptiveStore,

    breaker: RateLimitBreaker,
    cycle: u64,
    consecutive_empty_cycles: u32,
    last_patrol_run: Option<chrono::DateTime<Utc>>,
    last_auth_preflight: Option<chrono::DateTime<Utc>>,

    progress: HashMap<u64, ProgressHistory>,
    nudge_sent: HashMap<u64, bool>,
    children: HashMap<u64, Child>,
    system: System,
}

/// Summary of one poll cycle, mostly useful for tests and `daemon
/// status`-style reporting.
#[derive(Debug, Default, Clone)]
pub struct PollSummary {
    pub spawned: u32,
    pub enqueued: u32,
    pub reaped_success: u32,
    pub reaped_failure: u32,
    pub retried: u32,
    pub terminal_failures: u32,
    pub skipped_paused: bool,
    pub skipped_backoff: bool,
}

impl<T: TrackerClient, L: WorkerLauncher> Supervisor<T, L> {
    pub fn new(paths: Paths, config: DaemonConfig, tracker: T, launcher: L) -> Self {
        let state = StateStore::new(paths.state_dir());
        let memory = MemoryStore::new(paths.state_dir());
        let baselines = BaselineStore::new(paths.state_dir());
        let adaptive = AdaptiveStore::new(paths.state_dir());
        Self {
            paths,
            config,
            tracker,
            launcher,
            machine_id: hostname_fallback(),
            state,
            events_buffer: EventLog::new(),
            memory,
            baselines,
            adaptive,
            breaker: RateLimitBreaker::new(),
            cycle: 0,
            consecutive_empty_cycles: 0,
            last_patrol_run: None,
            last_auth_preflight: None,
            progress: HashMap::new(),
            nudge_sent: HashMap::new(),
            children: HashMap::new(),
            system: System::new(),
        }
    }

    fn emit(&mut self, event_type: EventType, issue_id: Option<u64>) {
        let event = ShipwrightEvent::new(event_type, issue_id);
        if should_notify_webhook(&event.event_type) {
            if let Some(url) = &self.config.notifications.slack_webhook {
                let cfg = shipwright_webhook::WebhookConfig {
                    url: url.clone(),
                    webhook_type: shipwright_webhook::WebhookType::Slack,
                    secret: None,
                    timeout_secs: 10,
                };
                let payload = webhook_payload_for(&event.event_type, event.issue_id);
                shipwright_webhook::notify_fire_and_forget(cfg, payload);
            }
        }
        self.events_buffer.record(event);
    }

    fn flush_events(&mut self) {
        let path = shipwright_events::events_path(self.paths.state_dir());
        if let Err(err) = self.events_buffer.write_to_file(&path) {
            eprintln!("warning: failed to append events: {err:#}");
        }
        self.events_buffer.clear();
    }

    /// Run the poll loop until `shutdown` is set, cleaning up tracked
    /// children on the way out.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        use std::sync::atomic::Ordering;

        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = self.poll_once() {
                eprintln!("warning: poll cycle failed: {err:#}");
            }
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            let queue_depth = self.state.load().map(|s| s.queued.len()).unwrap_or(0);
            let interval = shipwright_adaptive::poll_interval(queue_depth, self.consecutive_empty_cycles);
            signals::interruptible_sleep(interval, shutdown);
        }

        self.shutdown_children();
        Ok(())
    }

    fn shutdown_children(&mut self) {
        for (issue_id, child) in self.children.iter_mut() {
            let pid = child.id();
            let _ = shipwright_process::run_command_simple("kill", &["-TERM", &pid.to_string()]);
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if std::time::Instant::now() >= deadline => {
                        let _ = shipwright_process::run_command_simple("kill", &["-KILL", &pid.to_string()]);
                        break;
                    }
                    Ok(None) => std::thread::sleep(std::time::Duration::from_millis(100)),
                    Err(_) => break,
                }
            }
            eprintln!("shut down worker for issue #{issue_id} (pid {pid})");
        }
        self.children.clear();
        let _ = std::fs::remove_file(self.paths.pid_file());
        let _ = std::fs::remove_file(self.paths.shutdown_flag());
    }

    /// One full poll cycle.
    pub fn poll_once(&mut self) -> Result<PollSummary> {
        self.cycle += 1;
        let mut summary = PollSummary::default();

        // Step 1: preflight auth every 5 minutes.
        let now = Utc::now();
        let due_preflight = self
            .last_auth_preflight
            .map(|last| now.signed_duration_since(last).num_seconds() >= 300)
            .unwrap_or(true);
        if due_preflight {
            self.last_auth_preflight = Some(now);
            let preflight = shipwright_auth::preflight(Some(&self.paths.home));
            if !preflight.ok() {
                let reason = preflight.failure_reason().unwrap_or("auth_failure").to_string();
                self.write_pause_flag(&reason, now + chrono::Duration::hours(1))?;
                self.emit(
                    EventType::DaemonAutoPause { reason, resume_after: now + chrono::Duration::hours(1) },
                    None,
                );
            }
        }

        // Step 2: pause flag.
        if let Some(resume_after) = self.read_pause_flag()? {
            if now < resume_after {
                summary.skipped_paused = true;
                self.flush_events();
                return Ok(summary);
            }
            self.clear_pause_flag()?;
        }

        // Step 3: rate-limit backoff.
        if self.breaker.should_skip() {
            summary.skipped_backoff = true;
            self.flush_events();
            return Ok(summary);
        }

        // Step 4: poll candidates, score, order.
        let candidates = match with_retry(|| self.tracker.poll_labeled_issues(&self.config.watch_label)) {
            Ok(issues) => {
                self.breaker.record_success();
                issues
            }
            Err(err) => {
                self.breaker.record_failure();
                self.emit(EventType::DaemonRateLimit { backoff_s: self.breaker.backoff().as_secs() }, None);
                eprintln!("warning: failed to poll tracker: {err:#}");
                self.flush_events();
                return Ok(summary);
            }
        };

        let state_snapshot = self.state.load()?;
        let prior_outcome_lookup = |issue_id: u64| -> Option<PriorOutcome> {
            state_snapshot
                .completed
                .iter()
                .rev()
                .find(|j| j.issue_id == issue_id)
                .map(|j| match j.status {
                    shipwright_types::JobStatus::Reaped { success: true } => PriorOutcome::Success,
                    _ => PriorOutcome::Failure,
                })
        };
        let scored = score_all(candidates, &prior_outcome_lookup, None);
        let ordered = reorder_for_dependencies(scored);
        let strategy = priority_strategy(&self.config.intelligence.priority_strategy);
        let mut ordered = ordered;
        sort_by_strategy(&mut ordered, strategy);

        // Cache titles for every polled issue.
        self.state.mutate(|state| {
            for c in &ordered {
                state.titles.insert(c.issue.id, c.issue.title.clone());
            }
            Ok(())
        })?;

        // Step 5 + 6: spawn/enqueue decisions, then drain.
        for candidate in &ordered {
            self.try_spawn_or_enqueue(candidate, &mut summary)?;
        }
        self.drain_queue(&mut summary)?;

        // Step 7: reap.
        self.reap_exited(&mut summary)?;

        // Step 8: health check survivors.
        self.health_check_survivors()?;

        // Step 9: periodic tasks.
        self.run_periodic_tasks()?;

        self.state.mutate(|state| {
            state.last_poll = Some(Utc::now());
            Ok(())
        })?;

        if summary.spawned == 0 && summary.enqueued == 0 {
            self.consecutive_empty_cycles = self.consecutive_empty_cycles.saturating_add(1);
        } else {
            self.consecutive_empty_cycles = 0;
        }

        self.flush_events();
        Ok(summary)
    }

    fn try_spawn_or_enqueue(&mut self, candidate: &Candidate, summary: &mut PollSummary) -> Result<()> {
        let state = self.state.load()?;
        if state.is_in_flight(candidate.issue.id) {
            return Ok(());
        }

        if claim_issue(&self.tracker, None, candidate.issue.id, &self.machine_id).unwrap_or(false) {
            // claimed (or claim best-effort failed open); continue.
        } else {
            return Ok(());
        }

        let priority_eligible = self.config.priority_lane.enabled
            && is_priority_eligible(&candidate.issue.labels, &self.config.priority_lane.labels);

        if priority_eligible && (state.priority_lane_active.len() as u32) < self.config.priority_lane.max {
            self.spawn_job(candidate, None, 0)?;
            summary.spawned += 1;
            self.state.mutate(|s| {
                s.priority_lane_active.push(candidate.issue.id);
                Ok(())
            })?;
            return Ok(());
        }

        if (state.active_jobs.len() as u32) < self.config.max_parallel {
            self.spawn_job(candidate, None, 0)?;
            summary.spawned += 1;
        } else {
            self.state.mutate(|s| {
                if !s.queued.iter().any(|q| q.issue_id == candidate.issue.id) {
                    s.queued.push(enqueue_entry(candidate.issue.id, candidate.score));
                }
                Ok(())
            })?;
            summary.enqueued += 1;
        }
        Ok(())
    }

    fn drain_queue(&mut self, summary: &mut PollSummary) -> Result<()> {
        loop {
            let state = self.state.load()?;
            if (state.active_jobs.len() as u32) >= self.config.max_parallel {
                break;
            }
            let Some(next) = state.queued.first().cloned() else {
                break;
            };

            let issues = self.tracker.poll_labeled_issues(&self.config.watch_label).unwrap_or_default();
            let Some(issue) = issues.into_iter().find(|i| i.id == next.issue_id) else {
                self.state.mutate(|s| {
                    s.queued.retain(|q| q.issue_id != next.issue_id);
                    Ok(())
                })?;
                continue;
            };
            let candidate = Candidate { issue, score: next.triage_score, depends_on: Vec::new() };

            self.state.mutate(|s| {
                s.queued.retain(|q| q.issue_id != next.issue_id);
                Ok(())
            })?;
            self.spawn_job(&candidate, None, 0)?;
            summary.spawned += 1;
        }
        Ok(())
    }

    fn spawn_job(&mut self, candidate: &Candidate, model_override: Option<String>, retry_count: u32) -> Result<()> {
        let worktrees = WorktreeManager::default_for_repo(&self.paths.repo_root);
        let worktree = worktrees
            .prepare(candidate.issue.id, &self.config.base_branch)
            .context("failed to prepare worktree")?;

        let template_input = self.template_input(candidate);
        let template = shipwright_template::select(&template_input);

        let config_path = shipwright_config::config_path(&self.paths.repo_root);
        let spec = build_worker_spec(
            &self.paths,
            candidate,
            worktree.path.clone(),
            worktree.branch.clone(),
            &self.config.base_branch,
            &template.name,
            config_path,
            has_checkpoint_for_workspace(&worktree.path),
            model_override,
        );

        let mut child = self.launcher.spawn(&spec).context("failed to spawn worker")?;
        let pid = child.id();
        let job = build_job(&spec, pid, retry_count);
        self.children.insert(candidate.issue.id, child);

        self.state.mutate(|s| {
            s.active_jobs.push(job);
            Ok(())
        })?;

        self.emit(EventType::DaemonSpawn { pid, template: template.name.clone() }, Some(candidate.issue.id));
        let _ = self.tracker.add_label(candidate.issue.id, "pipeline/in-progress");
        Ok(())
    }

    fn template_input(&self, candidate: &Candidate) -> TemplateSelectionInput {
        let recent = self.recent_completions(5);
        TemplateSelectionInput {
            labels: candidate.issue.labels.clone(),
            triage_score: candidate.score,
            ai_composed: None,
            recent_completions: recent,
            branch_protection_strict: false,
            template_map: self.config.template_map.clone().into_iter().collect(),
            match_text: format!("{} {}", candidate.issue.title, candidate.issue.labels.join(" ")),
            quality_memory: Some(QualityMemorySignal::default()),
            template_weights: HashMap::new(),
        }
    }

    fn recent_completions(&self, n: usize) -> Vec<ShipwrightEvent> {
        let path = shipwright_events::events_path(self.paths.state_dir());
        let log = EventLog::read_all(&path).unwrap_or_else(|_| EventLog::new());
        log.all_events()
            .iter()
            .filter(|e| matches!(e.event_type, EventType::PipelineCompleted { .. }))
            .rev()
            .take(n)
            .rev()
            .cloned()
            .collect()
    }

    fn reap_exited(&mut self, summary: &mut PollSummary) -> Result<()> {
        let state = self.state.load()?;
        let mut consecutive_same_class = 0u32;

        for job in state.active_jobs.clone() {
            let alive = self.is_alive(job.issue_id, job.pid);
            if alive {
                continue;
            }

            let log_tail = read_log_tail(&self.paths.log_file(job.issue_id), 64 * 1024);
            let wait_exit_success = self.reap_child_exit_status(job.issue_id);
            let success = determine_success(&log_tail, wait_exit_success);

            self.children.remove(&job.issue_id);
            let _ = release_claim(&self.tracker, None, job.issue_id, &self.machine_id);

            if success {
                summary.reaped_success += 1;
                self.on_job_success(&job)?;
            } else {
                let prior = state.retry_counts.get(&job.issue_id).cloned();
                let outcome = classify_and_plan_retry(
                    &log_tail,
                    prior.as_ref(),
                    self.config.max_retries,
                    self.config.retry_escalation,
                );
                self.state.mutate(|s| {
                    s.push_failure(FailureHistoryEntry { ts: Utc::now(), class: class_of(&outcome) });
                    Ok(())
                })?;
                consecutive_same_class = self.state.load()?.consecutive_same_class_failures();

                match outcome {
                    ReapOutcome::Retry { class, attempt, escalate_model, escalate_template } => {
                        summary.retried += 1;
                        self.on_job_retry(&job, class, attempt, escalate_model, escalate_template)?;
                    }
                    ReapOutcome::Terminal { class } => {
                        summary.terminal_failures += 1;
                        self.on_job_terminal(&job, class)?;
                    }
                }
            }

            self.emit(EventType::DaemonReap { pid: job.pid, success }, Some(job.issue_id));
            self.state.mutate(|s| {
                s.active_jobs.retain(|j| j.issue_id != job.issue_id);
                s.priority_lane_active.retain(|id| *id != job.issue_id);
                Ok(())
            })?;
        }

        if consecutive_same_class >= self.config.alerts.consecutive_failure_threshold {
            let pause_minutes = shipwright_retry::consecutive_failure_pause_minutes(consecutive_same_class);
            if !pause_minutes.is_zero() {
                let resume_after = Utc::now() + chrono::Duration::seconds(pause_minutes.as_secs() as i64);
                self.write_pause_flag("consecutive_same_class_failures", resume_after)?;
            }
        }
        Ok(())
    }

    fn is_alive(&mut self, issue_id: u64, pid: u32) -> bool {
        if let Some(child) = self.children.get_mut(&issue_id) {
            return matches!(child.try_wait(), Ok(None));
        }
        shipwright_process::run_command_simple("kill", &["-0", &pid.to_string()]).unwrap_or(false)
    }

    fn reap_child_exit_status(&mut self, issue_id: u64) -> Option<bool> {
        self.children
            .get_mut(&issue_id)
            .and_then(|c| c.try_wait().ok().flatten())
            .map(|status| status.success())
    }

    fn on_job_success(&mut self, job: &shipwright_types::Job) -> Result<()> {
        self.state.mutate(|s| {
            s.complete_job(job.issue_id);
            Ok(())
        })?;
        let duration_s = (Utc::now() - job.started_at).num_seconds().max(0) as f64;
        let _ = self.adaptive.record_pipeline_duration(&job.template, duration_s);
        let _ = self.adaptive.record_template_outcome(&job.template, true);
        if let Some(label) = &self.config.on_success.remove_label {
            let _ = self.tracker.remove_label(job.issue_id, label);
        }
        let _ = self.tracker.remove_label(job.issue_id, "pipeline/in-progress");
        if let Some(label) = &self.config.on_success.add_label {
            let _ = self.tracker.add_label(job.issue_id, label);
        }
        if self.config.on_success.close_issue {
            let _ = self.tracker.close_issue(job.issue_id);
        }
        let worktrees = WorktreeManager::default_for_repo(&self.paths.repo_root);
        let _ = worktrees.teardown(job.issue_id, false);
        Ok(())
    }

    fn on_job_retry(
        &mut self,
        job: &shipwright_types::Job,
        class: FailureClass,
        attempt: u32,
        escalate_model: bool,
        escalate_template: bool,
    ) -> Result<()> {
        self.emit(EventType::DaemonRetry { attempt, class }, Some(job.issue_id));

        self.state.mutate(|s| {
            s.retry_counts.insert(
                job.issue_id,
                shipwright_types::RetryRecord {
                    issue_id: job.issue_id,
                    attempt_count: attempt,
                    last_failure_class: Some(class),
                    max_retries_for_class: self.config.max_retries,
                },
            );
            Ok(())
        })?;

        let resume = has_checkpoint(job);
        let model_override = escalate_model.then(|| "most-capable".to_string());
        let template_name = if escalate_template { "full".to_string() } else { job.template.clone() };

        let worktrees = WorktreeManager::default_for_repo(&self.paths.repo_root);
        let worktree = worktrees.prepare(job.issue_id, &self.config.base_branch).context("retry worktree prepare")?;

        let config_path = shipwright_config::config_path(&self.paths.repo_root);
        let spec = WorkerSpec {
            issue_id: job.issue_id,
            workspace: worktree.path,
            repo_root: self.paths.repo_root.clone(),
            template: template_name,
            goal: job.goal.clone(),
            title: job.title.clone(),
            branch: worktree.branch,
            base_branch: self.config.base_branch.clone(),
            config_path,
            log_file: self.paths.log_file(job.issue_id),
            resume,
            model_override,
        };

        let mut child = self.launcher.spawn(&spec).context("failed to spawn retry worker")?;
        let pid = child.id();
        let new_job = build_job(&spec, pid, attempt);
        self.children.insert(job.issue_id, child);
        self.state.mutate(|s| {
            s.active_jobs.push(new_job);
            Ok(())
        })?;
        self.emit(EventType::DaemonSpawn { pid, template: spec_template_name(&spec) }, Some(job.issue_id));
        Ok(())
    }

    fn on_job_terminal(&mut self, job: &shipwright_types::Job, class: FailureClass) -> Result<()> {
        self.emit(EventType::DaemonRetryExhausted { class }, Some(job.issue_id));
        let _ = self.adaptive.record_template_outcome(&job.template, false);
        self.state.mutate(|s| {
            let mut terminal = job.clone();
            terminal.status = shipwright_types::JobStatus::Reaped { success: false };
            s.completed.push(terminal);
            if s.completed.len() > shipwright_state::MAX_COMPLETED {
                let excess = s.completed.len() - shipwright_state::MAX_COMPLETED;
                s.completed.drain(0..excess);
            }
            s.retry_counts.remove(&job.issue_id);
            Ok(())
        })?;
        if let Some(label) = &self.config.on_failure.add_label {
            let _ = self.tracker.add_label(job.issue_id, label);
        }
        let _ = self.tracker.remove_label(job.issue_id, &self.config.watch_label);
        let _ = self.tracker.remove_label(job.issue_id, "pipeline/in-progress");
        let log_tail = read_log_tail(&self.paths.log_file(job.issue_id), 4096);
        let lines: Vec<&str> = log_tail.lines().rev().take(self.config.on_failure.comment_log_lines as usize).collect();
        let _ = self.tracker.post_comment(
            job.issue_id,
            &format!("Pipeline failed ({class:?}) after {} attempt(s).\n\n```\n{}\n```", job.retry_count + 1, lines.into_iter().rev().collect::<Vec<_>>().join("\n")),
        );
        let worktrees = WorktreeManager::default_for_repo(&self.paths.repo_root);
        let _ = worktrees.teardown(job.issue_id, false);
        let _ = self
            .memory
            .record_failure(&classify_failure_signature(&log_tail), "pipeline", None);
        Ok(())
    }

    fn health_check_survivors(&mut self) -> Result<()> {
        let state = self.state.load()?;
        for job in &state.active_jobs {
            let history = self.progress.entry(job.issue_id).or_default();
            let nudge_sent = self.nudge_sent.entry(job.issue_id).or_insert(false);
            let was_nudged_already = *nudge_sent;
            let check = check_job_health(
                &self.paths,
                job.issue_id,
                &job.workspace_path,
                job.started_at,
                job.pid,
                history,
                nudge_sent,
                &mut self.system,
                &self.config.health,
            );
            if *nudge_sent && !was_nudged_already {
                self.emit(EventType::DaemonAlert { message: format!("nudged stalled worker for issue #{}", job.issue_id) }, Some(job.issue_id));
            }
            if check.response == shipwright_progress::Response::Kill {
                if let Some(child) = self.children.get_mut(&job.issue_id) {
                    let _ = child.kill();
                }
            }
        }
        Ok(())
    }

    fn run_periodic_tasks(&mut self) -> Result<()> {
        if periodic::due(self.cycle, periodic::CONFIG_RELOAD_EVERY) {
            let config_path = shipwright_config::config_path(&self.paths.repo_root);
            self.config = shipwright_config::load_or_default(&config_path);
        }

        if periodic::due(self.cycle, periodic::DEGRADATION_ALERT_EVERY) {
            let state = self.state.load()?;
            if state.consecutive_same_class_failures() >= self.config.alerts.consecutive_failure_threshold {
                self.emit(EventType::DaemonAlert { message: "consecutive same-class failures detected".to_string() }, None);
            }
            if state.queued.len() as u32 >= self.config.alerts.queue_depth_warn {
                self.emit(EventType::DaemonAlert { message: format!("queue depth {} exceeds warn threshold", state.queued.len()) }, None);
            }
        }

        if self.config.auto_scale.enabled {
            let interval_cycles = (self.config.auto_scale.interval.0.as_secs() / self.config.poll_interval.0.as_secs().max(1)).max(1);
            if periodic::due(self.cycle, interval_cycles) {
                self.run_autoscale()?;
            }
        }

        if self.config.self_optimize && periodic::due(self.cycle, self.config.optimize_interval as u64) {
            self.run_self_optimize()?;
        }

        if self.config.stale_reaper.enabled {
            let interval_cycles = (self.config.stale_reaper.interval.0.as_secs() / self.config.poll_interval.0.as_secs().max(1)).max(1);
            if periodic::due(self.cycle, interval_cycles) {
                self.run_stale_reaper()?;
            }
        }

        if self.config.patrol.enabled {
            let state = self.state.load()?;
            if periodic::patrol_due(
                state.active_jobs.len(),
                state.queued.len(),
                self.last_patrol_run,
                self.config.patrol.interval.0,
                Utc::now(),
            ) {
                self.run_patrol()?;
                self.last_patrol_run = Some(Utc::now());
            }
        }

        Ok(())
    }

    fn run_autoscale(&mut self) -> Result<()> {
        self.system.refresh_memory();
        let cores = num_cpus::get();
        let available_memory_gib = self.system.available_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let state = self.state.load()?;
        let inputs = ScalingInputs {
            cores,
            load_average_one: shipwright_autoscale::current_load_average_one(),
            available_memory_gib,
            worker_memory_gib: self.config.auto_scale.worker_mem_gb,
            remaining_budget_usd: f64::MAX,
            cost_per_job_usd: self.config.auto_scale.estimated_cost_per_job_usd.max(0.01),
            queued: state.queued.len() as u32,
            active: state.active_jobs.len() as u32,
            avg_health_pct: None,
            fleet_ceiling: None,
            max_workers: self.config.auto_scale.max_workers,
            min_workers: self.config.auto_scale.min_workers,
        };
        let caps = shipwright_autoscale::compute_caps(&inputs);
        let success_rate = self.historical_success_rate();
        let allowed = shipwright_adaptive::scale_up_allowed(success_rate);
        let new_max = shipwright_autoscale::step_toward_target(
            self.config.max_parallel,
            caps.target,
            allowed,
            self.config.auto_scale.min_workers,
            self.config.auto_scale.max_workers,
        );
        if new_max != self.config.max_parallel {
            self.config.max_parallel = new_max;
            let config_path = shipwright_config::config_path(&self.paths.repo_root);
            let _ = shipwright_config::save(&config_path, &self.config);
            self.emit(
                EventType::DaemonScale {
                    max_parallel: new_max,
                    cpu_cap: caps.cpu_cap,
                    memory_cap: caps.memory_cap,
                    budget_cap: caps.budget_cap,
                    queue_cap: caps.queue_cap,
                },
                None,
            );
        }
        let _ = self.adaptive.mutate_tuning(|doc| {
            doc.max_parallel = self.config.max_parallel;
            Ok(())
        });
        Ok(())
    }

    fn historical_success_rate(&self) -> f64 {
        let state = self.state.load().unwrap_or_else(|_| shipwright_state::DaemonState::new(std::process::id()));
        let total = state.completed.len();
        if total == 0 {
            return 1.0;
        }
        let successes = state
            .completed
            .iter()
            .filter(|j| matches!(j.status, shipwright_types::JobStatus::Reaped { success: true }))
            .count();
        successes as f64 / total as f64
    }

    fn run_self_optimize(&mut self) -> Result<()> {
        let path = shipwright_events::events_path(self.paths.state_dir());
        let log = EventLog::read_all(&path).unwrap_or_default();
        let cutoff = Utc::now() - chrono::Duration::days(7);
        let recent: Vec<ShipwrightEvent> = log.events_ref().iter().filter(|e| e.ts >= cutoff).cloned().collect();
        let result = shipwright_optimizer::optimize(&mut self.config, &recent);
        if !result.changes.is_empty() {
            let config_path = shipwright_config::config_path(&self.paths.repo_root);
            shipwright_config::save(&config_path, &self.config)?;
            self.emit(EventType::DaemonOptimize { changes: result.changes.clone() }, None);
        }
        Ok(())
    }

    fn run_stale_reaper(&mut self) -> Result<()> {
        let worktrees_root = self.paths.worktrees_root();
        let Ok(entries) = std::fs::read_dir(&worktrees_root) else {
            return Ok(());
        };
        let cutoff = std::time::Duration::from_secs(self.config.stale_reaper.age_days as u64 * 86400);
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(age) = meta.modified().and_then(|m| m.elapsed().map_err(|e| std::io::Error::other(e))) else { continue };
            if age > cutoff {
                let _ = std::fs::remove_dir_all(entry.path());
            }
        }
        Ok(())
    }

    fn run_patrol(&mut self) -> Result<()> {
        let state = self.state.load()?;
        let existing_titles: Vec<String> = state.titles.values().cloned().collect();
        let path = shipwright_events::events_path(self.paths.state_dir());
        let log = EventLog::read_all(&path).unwrap_or_default();
        let cutoff = Utc::now() - chrono::Duration::days(7);
        let prev_cutoff = cutoff - chrono::Duration::days(7);
        let recent: Vec<ShipwrightEvent> = log.events_ref().iter().filter(|e| e.ts >= cutoff).cloned().collect();
        let previous: Vec<ShipwrightEvent> = log.events_ref().iter().filter(|e| e.ts >= prev_cutoff && e.ts < cutoff).cloned().collect();
        let metrics = HashMap::new();

        let ctx = PatrolContext {
            repo_root: &self.paths.repo_root,
            existing_open_titles: &existing_titles,
            max_issues: self.config.patrol.max_issues as usize,
            recent_events: &recent,
            previous_window_events: &previous,
            memory: Some(&self.memory),
            baselines: Some(&self.baselines),
            current_perf_metrics: &metrics,
        };
        let findings = shipwright_patrol::run_patrol(&ctx);
        for finding in findings {
            self.emit(
                EventType::PatrolFinding { signal: finding.signal.to_string(), detail: finding.detail.clone() },
                None,
            );
            let labels = self.config.patrol.labels.clone();
            if self
                .tracker
                .create_issue(&finding.title, &finding.detail, &labels)
                .is_ok()
            {
                self.emit(EventType::PatrolIssueCreated, None);
            }
        }
        Ok(())
    }

    fn write_pause_flag(&self, reason: &str, resume_after: chrono::DateTime<Utc>) -> Result<()> {
        let body = serde_json::json!({ "reason": reason, "resume_after": resume_after });
        std::fs::write(self.paths.pause_flag(), serde_json::to_string_pretty(&body)?)?;
        Ok(())
    }

    fn read_pause_flag(&self) -> Result<Option<chrono::DateTime<Utc>>> {
        let path = self.paths.pause_flag();
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let value: serde_json::Value = serde_json::from_str(&content).unwrap_or(serde_json::Value::Null);
        let resume_after = value
            .get("resume_after")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(Utc::now() + chrono::Duration::hours(1));
        Ok(Some(resume_after))
    }

    fn clear_pause_flag(&self) -> Result<()> {
        let path = self.paths.pause_flag();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

fn has_checkpoint_for_workspace(workspace: &std::path::Path) -> bool {
    shipwright_pipeline::state_path(workspace).exists()
}

fn class_of(outcome: &ReapOutcome) -> FailureClass {
    match outcome {
        ReapOutcome::Retry { class, .. } | ReapOutcome::Terminal { class } => *class,
        ReapOutcome::Success => FailureClass::Unknown,
    }
}

fn spec_template_name(spec: &WorkerSpec) -> String {
    spec.template.clone()
}

fn classify_failure_signature(log_tail: &str) -> String {
    log_tail.lines().last().unwrap_or("unknown failure").chars().take(200).collect()
}

fn priority_strategy(value: &str) -> shipwright_triage::PriorityStrategy {
    match value {
        "complex_first" | "complex-first" => shipwright_triage::PriorityStrategy::ComplexFirst,
        _ => shipwright_triage::PriorityStrategy::QuickWinsFirst,
    }
}

fn sort_by_strategy(candidates: &mut [Candidate], strategy: shipwright_triage::PriorityStrategy) {
    let mut pairs: Vec<(u64, i32)> = candidates.iter().map(|c| (c.issue.id, c.score)).collect();
    shipwright_triage::sort_candidates(&mut pairs, strategy);
    let order: HashMap<u64, usize> = pairs.iter().enumerate().map(|(i, (id, _))| (*id, i)).collect();
    candidates.sort_by_key(|c| order.get(&c.issue.id).copied().unwrap_or(usize::MAX));
}

fn should_notify_webhook(event_type: &EventType) -> bool {
    shipwright_webhook::should_notify(event_type)
}

fn webhook_payload_for(event_type: &EventType, issue_id: Option<u64>) -> shipwright_webhook::WebhookPayload {
    match event_type {
        EventType::PipelineCompleted { result, .. } => shipwright_webhook::pipeline_completed_payload(
            issue_id.unwrap_or(0),
            "",
            matches!(result, shipwright_types::PipelineResult::Success),
        ),
        EventType::DaemonAlert { message } => shipwright_webhook::daemon_alert_payload(message),
        EventType::DaemonAutoPause { reason, .. } => shipwright_webhook::daemon_alert_payload(&format!("daemon paused: {reason}")),
        EventType::DaemonRetryExhausted { class } => shipwright_webhook::daemon_alert_payload(&format!("retries exhausted: {class:?}")),
        _ => shipwright_webhook::daemon_alert_payload("shipwright event"),
    }
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("shipwright-{}", std::process::id()))
}
