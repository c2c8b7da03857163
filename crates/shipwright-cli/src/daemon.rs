//! `daemon init/start/stop/status/logs/metrics/triage/patrol`.

use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use shipwright_config::DaemonConfig;
use shipwright_events::EventLog;
use shipwright_state::StateStore;
use shipwright_supervisor::launcher::SelfExecLauncher;
use shipwright_supervisor::paths::Paths;
use shipwright_supervisor::Supervisor;
use shipwright_tracker::HttpTrackerClient;

use crate::reporter::{CliReporter, Reporter};
use crate::repo::{detect_repo_slug, tracker_base_url};

pub fn init(repo_root: &std::path::Path) -> Result<()> {
    let config = DaemonConfig::default();
    let path = shipwright_config::config_path(repo_root);
    shipwright_config::save(&path, &config)?;
    println!("wrote default config to {}", path.display());
    Ok(())
}

fn build_tracker(repo_root: &std::path::Path, config: &DaemonConfig) -> Result<HttpTrackerClient> {
    let auth = shipwright_auth::resolve_token(shipwright_auth::SERVICE_TRACKER, None);
    let base_url = tracker_base_url();

    let client = match config.watch_mode.as_str() {
        "org" => {
            let org = config
                .org
                .clone()
                .context("watch_mode is \"org\" but no org configured")?;
            HttpTrackerClient::org_wide(&base_url, &org, config.repo_filter.clone())
        }
        _ => {
            let repo = config
                .repo_filter
                .clone()
                .map(Ok)
                .unwrap_or_else(|| detect_repo_slug(repo_root))?;
            HttpTrackerClient::new(&base_url, &repo)
        }
    };

    Ok(if let Some(token) = auth.token {
        client.with_token(token)
    } else {
        client
    })
}

pub fn start(repo_root: std::path::PathBuf, config_path_override: Option<std::path::PathBuf>, no_tracker: bool) -> Result<()> {
    let home = shipwright_supervisor::paths::default_home();
    std::fs::create_dir_all(&home).with_context(|| format!("failed to create {}", home.display()))?;
    let paths = Paths::new(home, repo_root.clone());

    let config_path = config_path_override.unwrap_or_else(|| shipwright_config::config_path(&paths.repo_root));
    let config = shipwright_config::load_or_default(&config_path);

    let pid_file = paths.pid_file();
    if let Ok(existing) = std::fs::read_to_string(&pid_file) {
        if let Ok(pid) = existing.trim().parse::<u32>() {
            if shipwright_process::run_command_simple("kill", &["-0", &pid.to_string()]).unwrap_or(false) {
                bail!("daemon already running (pid {pid}); stop it first or remove {}", pid_file.display());
            }
        }
    }
    std::fs::write(&pid_file, std::process::id().to_string())?;

    let shutdown = shipwright_supervisor::signals::install()?;
    let mut reporter = CliReporter;
    reporter.info(&format!("shipwright daemon starting (pid {})", std::process::id()));

    if no_tracker {
        let tracker = NullTrackerClient;
        let launcher = SelfExecLauncher::new()?;
        let mut supervisor = Supervisor::new(paths, config, tracker, launcher);
        supervisor.run(&shutdown)?;
    } else {
        let tracker = build_tracker(&paths.repo_root, &config)?;
        let launcher = SelfExecLauncher::new()?;
        let mut supervisor = Supervisor::new(paths, config, tracker, launcher);
        supervisor.run(&shutdown)?;
    }

    reporter.info("shipwright daemon stopped");
    Ok(())
}

/// Stand-in tracker for `--no-tracker` runs (local dry-run / testing
/// the poll loop without a real issue source); always reports an empty
/// candidate set and no-ops every mutation.
struct NullTrackerClient;

impl shipwright_tracker::TrackerClient for NullTrackerClient {
    fn poll_labeled_issues(&self, _label: &str) -> Result<Vec<shipwright_tracker::TrackedIssue>> {
        Ok(Vec::new())
    }
    fn post_comment(&self, _issue_id: u64, _body: &str) -> Result<()> {
        Ok(())
    }
    fn add_label(&self, _issue_id: u64, _label: &str) -> Result<()> {
        Ok(())
    }
    fn remove_label(&self, _issue_id: u64, _label: &str) -> Result<()> {
        Ok(())
    }
    fn close_issue(&self, _issue_id: u64) -> Result<()> {
        Ok(())
    }
    fn create_issue(&self, _title: &str, _body: &str, _labels: &[String]) -> Result<u64> {
        Ok(0)
    }
}

pub fn stop(repo_root: std::path::PathBuf) -> Result<()> {
    let home = shipwright_supervisor::paths::default_home();
    let paths = Paths::new(home, repo_root);

    let pid_file = paths.pid_file();
    let Ok(content) = std::fs::read_to_string(&pid_file) else {
        println!("no running daemon found ({} does not exist)", pid_file.display());
        return Ok(());
    };
    let pid: u32 = content.trim().parse().context("corrupt pid file")?;

    std::fs::write(paths.shutdown_flag(), b"")?;

    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    while std::time::Instant::now() < deadline {
        if !shipwright_process::run_command_simple("kill", &["-0", &pid.to_string()]).unwrap_or(false) {
            println!("daemon stopped");
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    let _ = shipwright_process::run_command_simple("kill", &["-TERM", &pid.to_string()]);
    std::thread::sleep(Duration::from_secs(2));
    if shipwright_process::run_command_simple("kill", &["-0", &pid.to_string()]).unwrap_or(false) {
        let _ = shipwright_process::run_command_simple("kill", &["-KILL", &pid.to_string()]);
        println!("daemon killed (did not exit within grace period)");
    } else {
        println!("daemon stopped");
    }
    Ok(())
}

pub fn status(repo_root: std::path::PathBuf) -> Result<()> {
    let home = shipwright_supervisor::paths::default_home();
    let paths = Paths::new(home, repo_root);
    let store = StateStore::new(paths.state_dir());
    let state = store.load()?;

    println!("pid: {}", state.pid);
    println!("started_at: {}", state.started_at);
    println!("last_poll: {}", state.last_poll.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".into()));
    println!();

    println!("active ({}):", state.active_jobs.len());
    for job in &state.active_jobs {
        let elapsed = (Utc::now() - job.started_at).num_seconds().max(0);
        println!("  #{:<6} {:<10} {}s  {}", job.issue_id, job.template, elapsed, job.title);
    }

    println!("queued ({}):", state.queued.len());
    for entry in &state.queued {
        println!("  #{:<6} score={}", entry.issue_id, entry.triage_score);
    }

    println!("recent completed ({}):", state.completed.len().min(10));
    for job in state.completed.iter().rev().take(10) {
        let success = matches!(job.status, shipwright_types::JobStatus::Reaped { success: true });
        println!("  #{:<6} {}  {}", job.issue_id, if success { "success" } else { "failure" }, job.title);
    }

    Ok(())
}

pub fn logs(repo_root: std::path::PathBuf, follow: bool) -> Result<()> {
    let home = shipwright_supervisor::paths::default_home();
    let paths = Paths::new(home, repo_root);
    let path = shipwright_events::events_path(paths.state_dir());

    let mut printed = 0usize;
    loop {
        let log = EventLog::read_all(&path).unwrap_or_default();
        let events = log.all_events();
        for event in events.iter().skip(printed) {
            println!("{}", serde_json::to_string(event)?);
        }
        printed = events.len();

        if !follow {
            break;
        }
        std::thread::sleep(Duration::from_secs(2));
    }
    Ok(())
}

pub fn metrics(repo_root: std::path::PathBuf, period_days: i64, json: bool) -> Result<()> {
    let home = shipwright_supervisor::paths::default_home();
    let paths = Paths::new(home, repo_root);
    let path = shipwright_events::events_path(paths.state_dir());
    let log = EventLog::read_all(&path).unwrap_or_default();
    let cutoff = Utc::now() - chrono::Duration::days(period_days);
    let window: Vec<_> = log.all_events().iter().filter(|e| e.ts >= cutoff).cloned().collect();
    let signals = shipwright_events::dora::compute(&window);

    if json {
        let mut out = std::io::stdout();
        serde_json::to_writer_pretty(&mut out, &serde_json::json!({
            "period_days": period_days,
            "deploy_frequency_per_week": signals.deploy_frequency_per_week,
            "cycle_time_p50_minutes": signals.cycle_time_p50_minutes,
            "change_failure_rate": signals.change_failure_rate,
            "mttr_minutes": signals.mttr_minutes,
        }))?;
        writeln!(out)?;
    } else {
        println!("over the last {period_days} day(s):");
        println!("  deploy frequency:    {:.2}/week", signals.deploy_frequency_per_week);
        println!("  cycle time (p50):    {:.1} min", signals.cycle_time_p50_minutes);
        println!("  change failure rate: {:.1}%", signals.change_failure_rate * 100.0);
        match signals.mttr_minutes {
            Some(mttr) => println!("  mttr:                {mttr:.1} min"),
            None => println!("  mttr:                n/a"),
        }
    }
    Ok(())
}

pub fn triage(repo_root: std::path::PathBuf) -> Result<()> {
    let home = shipwright_supervisor::paths::default_home();
    let paths = Paths::new(home, repo_root.clone());
    let config_path = shipwright_config::config_path(&repo_root);
    let config = shipwright_config::load_or_default(&config_path);

    let tracker = build_tracker(&repo_root, &config)?;
    let issues = shipwright_tracker::with_retry(|| {
        use shipwright_tracker::TrackerClient;
        tracker.poll_labeled_issues(&config.watch_label)
    })?;

    let state = StateStore::new(paths.state_dir()).load().unwrap_or_else(|_| shipwright_state::DaemonState::new(std::process::id()));
    let candidates = shipwright_supervisor::candidates::score_all(issues, &|_id| None, None);
    let candidates = shipwright_supervisor::candidates::reorder_for_dependencies(candidates);

    let recent_events = recent_completions(&paths, 5);
    if candidates.is_empty() {
        println!("no candidates match label \"{}\"", config.watch_label);
        return Ok(());
    }

    let template_map: Vec<(String, String)> = config.template_map.clone().into_iter().collect();

    println!("{:<8} {:<6} {:<10} title", "issue", "score", "template");
    for candidate in &candidates {
        let input = shipwright_template::TemplateSelectionInput {
            labels: candidate.issue.labels.clone(),
            triage_score: candidate.score,
            ai_composed: None,
            recent_completions: recent_events.clone(),
            branch_protection_strict: false,
            template_map: template_map.clone(),
            match_text: format!("{} {}", candidate.issue.title, candidate.issue.body),
            quality_memory: None,
            template_weights: std::collections::HashMap::new(),
        };
        let template = shipwright_template::select(&input);
        println!(
            "#{:<7} {:<6} {:<10} {}",
            candidate.issue.id, candidate.score, template.name, candidate.issue.title
        );
    }
    let _ = state;
    Ok(())
}

fn recent_completions(paths: &Paths, n: usize) -> Vec<shipwright_types::ShipwrightEvent> {
    let path = shipwright_events::events_path(paths.state_dir());
    let log = EventLog::read_all(&path).unwrap_or_default();
    log.all_events()
        .iter()
        .rev()
        .filter(|e| matches!(e.event_type, shipwright_types::EventType::PipelineCompleted { .. }))
        .take(n)
        .cloned()
        .collect()
}

pub fn patrol(repo_root: std::path::PathBuf, once: bool, dry_run: bool) -> Result<()> {
    let _ = once;
    let home = shipwright_supervisor::paths::default_home();
    let paths = Paths::new(home, repo_root.clone());
    let config_path = shipwright_config::config_path(&repo_root);
    let config = shipwright_config::load_or_default(&config_path);

    let state = StateStore::new(paths.state_dir()).load().unwrap_or_else(|_| shipwright_state::DaemonState::new(std::process::id()));
    let existing_titles: Vec<String> = state.titles.values().cloned().collect();

    let path = shipwright_events::events_path(paths.state_dir());
    let log = EventLog::read_all(&path).unwrap_or_default();
    let cutoff = Utc::now() - chrono::Duration::days(7);
    let prev_cutoff = cutoff - chrono::Duration::days(7);
    let recent: Vec<_> = log.all_events().iter().filter(|e| e.ts >= cutoff).cloned().collect();
    let previous: Vec<_> = log.all_events().iter().filter(|e| e.ts >= prev_cutoff && e.ts < cutoff).cloned().collect();
    let metrics = std::collections::HashMap::new();

    let ctx = shipwright_patrol::PatrolContext {
        repo_root: &repo_root,
        existing_open_titles: &existing_titles,
        max_issues: config.patrol.max_issues as usize,
        recent_events: &recent,
        previous_window_events: &previous,
        memory: None,
        baselines: None,
        current_perf_metrics: &metrics,
    };
    let findings = shipwright_patrol::run_patrol(&ctx);

    if findings.is_empty() {
        println!("patrol: no findings");
        return Ok(());
    }

    for finding in &findings {
        println!("[{}] {}", finding.signal, finding.title);
        println!("  {}", finding.detail);
        if !dry_run {
            let tracker = build_tracker(&repo_root, &config)?;
            use shipwright_tracker::TrackerClient;
            match tracker.create_issue(&finding.title, &finding.detail, &config.patrol.labels) {
                Ok(id) => println!("  filed as #{id}"),
                Err(err) => println!("  failed to file issue: {err:#}"),
            }
        }
    }
    Ok(())
}
