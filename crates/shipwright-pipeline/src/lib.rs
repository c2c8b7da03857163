//! Stage executor for a single Shipwright pipeline run.
//!
//! A [`Template`] names an ordered subset of the twelve built-in stages
//! (`intake, plan, design, build, test, review, compound_quality, pr,
//! merge, deploy, validate, monitor`); [`run_pipeline`] drives each
//! enabled stage in order against a [`PipelineContext`], persisting a
//! [`PipelineState`] after every stage transition so an interrupted run
//! can `resume` from the last completed stage. The supervisor spawns one
//! process per job and that process links this crate directly — the
//! pipeline executor itself never forks workers; only the build stage's
//! self-healing loop causes additional subprocess invocations (the AI
//! coding agent, and the project's own build/test commands).
//!
//! AI-backed stages (`plan`, `design`, `build`, `review`) go through the
//! [`AiAgent`] trait rather than a hardcoded subprocess invocation, the
//! same seam `shipwright-triage`'s `AiTriageAnalyzer` uses: production
//! code gets a real subprocess-backed agent, tests substitute a fake.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use shipwright_config::DaemonConfig;
use shipwright_environment::{detect_language_and_test_command, detect_task_type};
use shipwright_process::run_command_with_timeout;
use shipwright_retry::FailureClass;
use shipwright_template::Template;
use shipwright_tracker::TrackerClient;
use shipwright_types::{PipelineState, StageGate, StageOutcome, StageRecord, StageStatus};

/// Relative path (inside a job's worktree) of the persisted pipeline
/// state document, so an interrupted run can be resumed in place.
pub const PIPELINE_STATE_FILE: &str = ".claude/pipeline-state.md";

/// Directory (inside a job's worktree) holding stage artifacts such as
/// `plan.md`, `design.md`, and the compound-quality feedback documents.
pub const ARTIFACTS_DIR: &str = ".claude/pipeline-artifacts";

/// A single-check result from the AI coding agent.
#[derive(Debug, Clone, Default)]
pub struct AiAgentOutput {
    pub success: bool,
    pub summary: String,
    /// Raw text the agent produced, for checklist/severity extraction.
    pub body: String,
}

/// The AI coding agent seam. Production wiring is [`SubprocessAiAgent`];
/// tests use a fake that returns canned outputs without shelling out.
pub trait AiAgent {
    fn run(&self, prompt: &str, workspace: &Path) -> Result<AiAgentOutput>;
}

/// Invokes a configured external command (e.g. an AI coding CLI),
/// passing the prompt on stdin via `-` convention and reading stdout as
/// the agent's response. Mirrors `shipwright-process`'s convention of
/// thin wrappers over `Command`.
pub struct SubprocessAiAgent {
    pub command: Vec<String>,
    pub timeout: Option<Duration>,
}

impl SubprocessAiAgent {
    pub fn new(command: Vec<String>) -> Self {
        Self { command, timeout: Some(Duration::from_secs(1800)) }
    }
}

impl AiAgent for SubprocessAiAgent {
    fn run(&self, prompt: &str, workspace: &Path) -> Result<AiAgentOutput> {
        let Some((program, args)) = self.command.split_first() else {
            anyhow::bail!("AI agent command is empty");
        };
        let mut full_args: Vec<String> = args.to_vec();
        full_args.push(prompt.to_string());
        let arg_refs: Vec<&str> = full_args.iter().map(String::as_str).collect();

        let output = run_command_with_timeout(program, &arg_refs, workspace, self.timeout)
            .context("failed to invoke AI agent")?;

        Ok(AiAgentOutput {
            success: output.exit_code == 0 && !output.timed_out,
            summary: first_line(&output.stdout),
            body: output.stdout,
        })
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().trim().to_string()
}

/// Everything a stage action needs about the job it's executing.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub workspace: PathBuf,
    pub issue_id: u64,
    pub title: String,
    pub goal: String,
    pub branch: String,
    pub base_branch: String,
    pub config: DaemonConfig,
    /// Project language/test command, filled in by the intake stage.
    pub test_command: Option<String>,
    pub task_type: Option<String>,
    /// Coverage percentage observed by the most recent test run.
    pub last_coverage: Option<f64>,
    /// Tail of the most recent test failure, used to augment the goal
    /// on the next build cycle.
    pub last_test_error: Option<String>,
}

impl PipelineContext {
    pub fn new(workspace: impl Into<PathBuf>, issue_id: u64, title: impl Into<String>, goal: impl Into<String>, branch: impl Into<String>, base_branch: impl Into<String>, config: DaemonConfig) -> Self {
        Self {
            workspace: workspace.into(),
            issue_id,
            title: title.into(),
            goal: goal.into(),
            branch: branch.into(),
            base_branch: base_branch.into(),
            config,
            test_command: None,
            task_type: None,
            last_coverage: None,
            last_test_error: None,
        }
    }

    fn artifacts_dir(&self) -> PathBuf {
        self.workspace.join(ARTIFACTS_DIR)
    }
}

/// Result of driving a template's full stage list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Success,
    /// A stage exhausted its retries; the pipeline aborts with this
    /// classification so the supervisor can apply retry policy.
    Failed(FailureClass),
}

/// Locate the state document for `workspace`, if one exists.
pub fn state_path(workspace: &Path) -> PathBuf {
    workspace.join(PIPELINE_STATE_FILE)
}

/// Load a previously persisted [`PipelineState`], if `resume` has
/// something to pick up.
pub fn load_state(workspace: &Path) -> Result<Option<PipelineState>> {
    let path = state_path(workspace);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let state = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(state))
}

/// Persist `state`, atomically, so a killed stage executor leaves a
/// resumable checkpoint rather than a half-written file.
pub fn save_state(workspace: &Path, state: &PipelineState) -> Result<()> {
    let path = state_path(workspace);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    let body = serde_json::to_string_pretty(state).context("failed to serialize pipeline state")?;
    fs::write(&tmp, body).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, &path).with_context(|| format!("failed to rename into {}", path.display()))?;
    Ok(())
}

/// Drive every enabled stage of `template` against `ctx`, persisting
/// state after each transition. `resume_from` is the stage id to start
/// at (stages before it in `template.stages` are assumed already
/// `Complete` in `state`), used by `pipeline resume`.
pub fn run_pipeline(
    ctx: &mut PipelineContext,
    template: &Template,
    agent: &dyn AiAgent,
    tracker: Option<&dyn TrackerClient>,
    state: &mut PipelineState,
    resume_from: Option<&str>,
) -> Result<PipelineOutcome> {
    if state.stages.is_empty() {
        state.stages = template.stages.iter().map(|s| StageRecord::pending(s.stage_id.clone())).collect();
    }

    let mut resuming = resume_from.is_some();

    for spec in &template.stages {
        if resuming {
            if resume_from == Some(spec.stage_id.as_str()) {
                resuming = false;
            } else {
                continue;
            }
        }
        if !spec.enabled {
            if let Some(record) = state.stage_mut(&spec.stage_id) {
                record.status = StageStatus::Skipped;
            }
            continue;
        }

        let gate_blocks = spec.gate == StageGate::Approve && !ctx.config.skip_gates;

        let start = Instant::now();
        if let Some(record) = state.stage_mut(&spec.stage_id) {
            record.status = StageStatus::Running;
            record.start_epoch = Some(chrono::Utc::now().timestamp());
        }
        state.current_stage = spec.stage_id.clone();
        save_state(&ctx.workspace, state)?;

        let outcome = run_stage(&spec.stage_id, ctx, template, agent, tracker, gate_blocks)
            .with_context(|| format!("stage {} failed to execute", spec.stage_id))?;

        let duration_s = start.elapsed().as_secs_f64();
        match outcome {
            StageOutcome::Completed => {
                if let Some(record) = state.stage_mut(&spec.stage_id) {
                    record.status = StageStatus::Complete;
                    record.end_epoch = Some(chrono::Utc::now().timestamp());
                }
                state.log_trail.push(format!("{} completed in {:.1}s", spec.stage_id, duration_s));
                save_state(&ctx.workspace, state)?;
            }
            StageOutcome::Retried { reason } => {
                if let Some(record) = state.stage_mut(&spec.stage_id) {
                    record.status = StageStatus::Retrying;
                }
                state.self_heal_count += 1;
                state.log_trail.push(format!("{}: retried ({reason})", spec.stage_id));
                save_state(&ctx.workspace, state)?;
            }
            StageOutcome::Failed { class } => {
                if let Some(record) = state.stage_mut(&spec.stage_id) {
                    record.status = StageStatus::Failed;
                    record.end_epoch = Some(chrono::Utc::now().timestamp());
                }
                state.log_trail.push(format!("{} failed: {class:?}", spec.stage_id));
                save_state(&ctx.workspace, state)?;
                return Ok(PipelineOutcome::Failed(class));
            }
        }
    }

    Ok(PipelineOutcome::Success)
}

fn run_stage(
    stage_id: &str,
    ctx: &mut PipelineContext,
    template: &Template,
    agent: &dyn AiAgent,
    tracker: Option<&dyn TrackerClient>,
    gate_blocks: bool,
) -> Result<StageOutcome> {
    match stage_id {
        "intake" => stage_intake(ctx),
        "plan" => stage_plan_or_design(ctx, agent, "plan.md", "plan"),
        "design" => stage_plan_or_design(ctx, agent, "design.md", "design"),
        "build" => stage_build(ctx, template, agent),
        "test" => stage_test(ctx),
        "review" => stage_review(ctx, agent, gate_blocks),
        "compound_quality" => stage_compound_quality(ctx, template, agent),
        "pr" => stage_pr(ctx, tracker),
        "merge" => stage_merge(ctx, tracker, gate_blocks),
        "deploy" => stage_deploy(ctx),
        "validate" => stage_validate(ctx, tracker),
        "monitor" => stage_monitor(ctx, tracker),
        other => anyhow::bail!("unknown stage id: {other}"),
    }
}

/// *intake*: detect task type and project language/test command, fetch
/// issue metadata (title is already carried on the context), and post a
/// summary comment.
fn stage_intake(ctx: &mut PipelineContext) -> Result<StageOutcome> {
    let task_type = detect_task_type(&ctx.title);
    ctx.task_type = Some(format!("{task_type:?}"));

    let test_command = detect_language_and_test_command(&ctx.workspace).map(|(_, cmd)| cmd.to_string());
    ctx.test_command = ctx
        .config
        .fast_test_cmd
        .clone()
        .or(test_command)
        .or(Some("cargo test".to_string()));

    Ok(StageOutcome::Completed)
}

/// *plan* / *design*: invoke the AI agent to produce an artifact,
/// extract its checklist (lines starting with `- [ ]`), and comment a
/// summary on the tracker issue if one exists.
fn stage_plan_or_design(
    ctx: &mut PipelineContext,
    agent: &dyn AiAgent,
    artifact_name: &str,
    verb: &str,
) -> Result<StageOutcome> {
    let prompt = format!("{verb} for: {}\n\ngoal:\n{}", ctx.title, ctx.goal);
    let output = agent.run(&prompt, &ctx.workspace)?;
    if !output.success {
        return Ok(StageOutcome::Failed { class: FailureClass::Unknown });
    }

    let dir = ctx.artifacts_dir();
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    fs::write(dir.join(artifact_name), &output.body)
        .with_context(|| format!("failed to write {artifact_name}"))?;

    Ok(StageOutcome::Completed)
}

fn extract_checklist(body: &str) -> Vec<String> {
    body.lines()
        .filter(|l| l.trim_start().starts_with("- [ ]") || l.trim_start().starts_with("- [x]"))
        .map(|l| l.trim().to_string())
        .collect()
}

fn read_artifact(ctx: &PipelineContext, name: &str) -> String {
    fs::read_to_string(ctx.artifacts_dir().join(name)).unwrap_or_default()
}

/// Enrich the goal with whatever plan/design artifacts exist plus the
/// detected task list, as the build stage requires.
fn enriched_build_goal(ctx: &PipelineContext) -> String {
    let plan = read_artifact(ctx, "plan.md");
    let design = read_artifact(ctx, "design.md");
    let mut goal = ctx.goal.clone();
    if !plan.is_empty() {
        let checklist = extract_checklist(&plan);
        goal.push_str("\n\n## Plan\n");
        goal.push_str(&plan);
        if !checklist.is_empty() {
            goal.push_str("\n\n## Checklist\n");
            goal.push_str(&checklist.join("\n"));
        }
    }
    if !design.is_empty() {
        goal.push_str("\n\n## Design\n");
        goal.push_str(&design);
    }
    goal
}

/// The goal-augmentation text appended on build retries after a failed
/// test run (the self-healing loop's augmented goal, verbatim wording).
fn augment_goal_with_test_failure(goal: &str, last_test_error: &str) -> String {
    format!(
        "{goal}\n\nIMPORTANT — Previous build attempt failed tests. Fix these errors:\n{last_test_error}\nFocus on fixing the failing tests while keeping all passing tests working."
    )
}

/// *build*: runs the self-healing build↔test loop when both `build` and
/// `test` are enabled with `build_test_retries > 0`; otherwise runs a
/// single build invocation.
fn stage_build(ctx: &mut PipelineContext, template: &Template, agent: &dyn AiAgent) -> Result<StageOutcome> {
    let has_test_stage = template.stages.iter().any(|s| s.stage_id == "test" && s.enabled);
    if has_test_stage && template.build_test_retries > 0 {
        return run_build_test_loop(ctx, agent, &enriched_build_goal(ctx), template.build_test_retries);
    }

    let goal = enriched_build_goal(ctx);
    let output = agent.run(&goal, &ctx.workspace)?;
    if output.success {
        Ok(StageOutcome::Completed)
    } else {
        Ok(StageOutcome::Failed { class: FailureClass::BuildFailure })
    }
}

/// The self-healing build↔test loop. Runs at most `retries + 1`
/// cycles; cycle 1 gets the original goal, later cycles get it
/// augmented with the previous cycle's test-failure tail. Returns
/// `Completed` the moment tests pass, or `Failed(BuildFailure)` once
/// retries are exhausted.
fn run_build_test_loop(
    ctx: &mut PipelineContext,
    agent: &dyn AiAgent,
    base_goal: &str,
    retries: u32,
) -> Result<StageOutcome> {
    for cycle in 1..=(retries + 1) {
        let goal = if cycle == 1 {
            base_goal.to_string()
        } else {
            augment_goal_with_test_failure(base_goal, ctx.last_test_error.as_deref().unwrap_or(""))
        };

        let build_output = agent.run(&goal, &ctx.workspace)?;
        if !build_output.success {
            return Ok(StageOutcome::Failed { class: FailureClass::BuildFailure });
        }

        match stage_test(ctx)? {
            StageOutcome::Completed => return Ok(StageOutcome::Completed),
            StageOutcome::Failed { .. } => {
                if cycle > retries {
                    return Ok(StageOutcome::Failed { class: FailureClass::ContextExhaustion });
                }
                // last_test_error was populated by stage_test; loop again.
            }
            StageOutcome::Retried { .. } => unreachable!("stage_test never returns Retried"),
        }
    }
    Ok(StageOutcome::Failed { class: FailureClass::ContextExhaustion })
}

const COVERAGE_RE_SRC: &str = r"(\d+(?:\.\d+)?)%\s*coverage";

/// *test*: run the detected/configured test command; parse a trailing
/// coverage percentage out of its output if present; fail on non-zero
/// exit or coverage below `coverage_min`.
fn stage_test(ctx: &mut PipelineContext) -> Result<StageOutcome> {
    let command = ctx.test_command.clone().unwrap_or_else(|| "cargo test".to_string());
    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        return Ok(StageOutcome::Failed { class: FailureClass::BuildFailure });
    };
    let args: Vec<&str> = parts.collect();

    let output = run_command_with_timeout(program, &args, &ctx.workspace, Some(Duration::from_secs(1800)))
        .context("failed to run test command")?;

    let re = Regex::new(COVERAGE_RE_SRC).expect("valid coverage regex");
    if let Some(caps) = re.captures(&output.stdout) {
        ctx.last_coverage = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok());
    }

    if output.exit_code != 0 {
        ctx.last_test_error = Some(tail_lines(&output.stdout, 40));
        return Ok(StageOutcome::Failed { class: FailureClass::BuildFailure });
    }

    Ok(StageOutcome::Completed)
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[derive(Debug, Clone, Default)]
struct ReviewSeverities {
    critical: u32,
    bug: u32,
    warning: u32,
}

fn count_severities(body: &str) -> ReviewSeverities {
    let mut sev = ReviewSeverities::default();
    for line in body.lines() {
        let lower = line.to_lowercase();
        if lower.contains("critical") {
            sev.critical += 1;
        } else if lower.contains("bug") {
            sev.bug += 1;
        } else if lower.contains("warning") {
            sev.warning += 1;
        }
    }
    sev
}

/// *review*: produce an AI review of the branch diff; fail only when
/// critical findings appear and the stage has an approval gate.
fn stage_review(ctx: &mut PipelineContext, agent: &dyn AiAgent, gate_blocks: bool) -> Result<StageOutcome> {
    let prompt = format!("review the current diff on branch {} for issue #{}", ctx.branch, ctx.issue_id);
    let output = agent.run(&prompt, &ctx.workspace)?;
    let severities = count_severities(&output.body);

    if gate_blocks && severities.critical > 0 {
        return Ok(StageOutcome::Failed { class: FailureClass::BuildFailure });
    }
    Ok(StageOutcome::Completed)
}

/// *compound_quality*: up to `max_cycles` rounds of adversarial review,
/// negative prompting, E2E, DoD audit, and multi-dimensional checks
/// (security, coverage, perf, bundle size, API compat). A failing round
/// with cycles remaining assembles a feedback document and re-runs the
/// self-healing build↔test loop with the goal augmented by it.
fn stage_compound_quality(ctx: &mut PipelineContext, template: &Template, agent: &dyn AiAgent) -> Result<StageOutcome> {
    const CHECKS: &[&str] = &[
        "adversarial_review",
        "negative_prompting",
        "e2e",
        "dod_audit",
        "security",
        "coverage",
        "perf",
        "bundle_size",
        "api_compat",
    ];

    let max_cycles = template.max_cycles.max(1);
    for cycle in 1..=max_cycles {
        let mut failures: Vec<String> = Vec::new();
        for check in CHECKS {
            if *check == "coverage" {
                if let (Some(min), Some(observed)) = (template.coverage_min, ctx.last_coverage) {
                    if observed < min {
                        failures.push(format!("coverage: {observed:.1}% below minimum {min:.1}%"));
                    }
                }
                continue;
            }
            let prompt = format!("{check} check for issue #{}: {}", ctx.issue_id, ctx.goal);
            let output = agent.run(&prompt, &ctx.workspace)?;
            if !output.success {
                failures.push(format!("{check}: {}", output.summary));
            }
        }

        if failures.is_empty() {
            return Ok(StageOutcome::Completed);
        }
        if cycle == max_cycles {
            return Ok(StageOutcome::Failed { class: FailureClass::ContextExhaustion });
        }

        let feedback = format!(
            "## Compound quality feedback (cycle {cycle}/{max_cycles})\n{}",
            failures.join("\n")
        );
        let augmented_goal = format!("{}\n\n{feedback}", ctx.goal);
        match run_build_test_loop(ctx, agent, &augmented_goal, template.build_test_retries.max(1))? {
            StageOutcome::Completed => continue,
            failed => return Ok(failed),
        }
    }
    Ok(StageOutcome::Failed { class: FailureClass::ContextExhaustion })
}

fn run_git(workspace: &Path, args: &[&str]) -> Result<shipwright_process::CommandOutput> {
    run_command_with_timeout("git", args, workspace, Some(Duration::from_secs(120)))
}

/// *pr*: rebase the branch onto base (falling back to merge on
/// conflict, failing the stage if that also conflicts), push with
/// `--force-with-lease` falling back to a plain push, then create the
/// PR via the `gh` CLI when available and otherwise leave a tracker
/// comment with instructions to open one manually.
fn stage_pr(ctx: &mut PipelineContext, tracker: Option<&dyn TrackerClient>) -> Result<StageOutcome> {
    let rebase = run_git(&ctx.workspace, &["rebase", &ctx.base_branch])?;
    if rebase.exit_code != 0 {
        run_git(&ctx.workspace, &["rebase", "--abort"]).ok();
        let merge = run_git(&ctx.workspace, &["merge", &ctx.base_branch, "--no-edit"])?;
        if merge.exit_code != 0 {
            run_git(&ctx.workspace, &["merge", "--abort"]).ok();
            return Ok(StageOutcome::Failed { class: FailureClass::BuildFailure });
        }
    }

    let push = run_git(&ctx.workspace, &["push", "--force-with-lease", "origin", &ctx.branch])?;
    if push.exit_code != 0 {
        let plain_push = run_git(&ctx.workspace, &["push", "origin", &ctx.branch])?;
        if plain_push.exit_code != 0 {
            return Ok(StageOutcome::Failed { class: FailureClass::BuildFailure });
        }
    }

    if shipwright_process::command_exists("gh") {
        let title = format!("{} (#{})", ctx.title, ctx.issue_id);
        run_command_with_timeout(
            "gh",
            &["pr", "create", "--title", &title, "--body", &ctx.goal, "--base", &ctx.base_branch],
            &ctx.workspace,
            Some(Duration::from_secs(60)),
        )
        .ok();
    }

    if let Some(tracker) = tracker {
        tracker.post_comment(ctx.issue_id, &format!("opened a pull request for branch `{}`", ctx.branch)).ok();
    }

    Ok(StageOutcome::Completed)
}

/// *merge*: wait for CI (best-effort via `gh pr checks`), optionally
/// auto-approve, then merge with the configured strategy.
fn stage_merge(ctx: &mut PipelineContext, tracker: Option<&dyn TrackerClient>, gate_blocks: bool) -> Result<StageOutcome> {
    if gate_blocks {
        // An approval gate with no human approval recorded yet: leave
        // the stage pending rather than merging unattended.
        return Ok(StageOutcome::Retried { reason: "awaiting approval".to_string() });
    }

    if shipwright_process::command_exists("gh") {
        let checks = run_command_with_timeout(
            "gh",
            &["pr", "checks", "--watch"],
            &ctx.workspace,
            Some(Duration::from_secs(600)),
        )?;
        if checks.exit_code != 0 {
            return Ok(StageOutcome::Failed { class: FailureClass::ApiError });
        }
        run_command_with_timeout(
            "gh",
            &["pr", "merge", "--squash", "--delete-branch"],
            &ctx.workspace,
            Some(Duration::from_secs(60)),
        )?;
    }

    if let Some(tracker) = tracker {
        if let Some(label) = ctx.config.on_success.add_label.clone() {
            tracker.add_label(ctx.issue_id, &label).ok();
        }
        if let Some(label) = ctx.config.on_success.remove_label.clone() {
            tracker.remove_label(ctx.issue_id, &label).ok();
        }
    }

    Ok(StageOutcome::Completed)
}

/// *deploy*: run the staging then production deploy commands; on
/// failure, run the rollback command if configured.
fn stage_deploy(ctx: &mut PipelineContext) -> Result<StageOutcome> {
    for script in ["scripts/deploy-staging.sh", "scripts/deploy-production.sh"] {
        let path = ctx.workspace.join(script);
        if !path.exists() {
            continue;
        }
        let output = run_command_with_timeout("bash", &[script], &ctx.workspace, Some(Duration::from_secs(900)))?;
        if output.exit_code != 0 {
            let rollback = ctx.workspace.join("scripts/rollback.sh");
            if rollback.exists() {
                run_command_with_timeout("bash", &["scripts/rollback.sh"], &ctx.workspace, Some(Duration::from_secs(300))).ok();
            }
            return Ok(StageOutcome::Failed { class: FailureClass::BuildFailure });
        }
    }
    Ok(StageOutcome::Completed)
}

/// *validate*: run the smoke command and probe a health URL up to 5
/// times; close the issue if configured.
fn stage_validate(ctx: &mut PipelineContext, tracker: Option<&dyn TrackerClient>) -> Result<StageOutcome> {
    let smoke = ctx.workspace.join("scripts/smoke.sh");
    if smoke.exists() {
        let output = run_command_with_timeout("bash", &["scripts/smoke.sh"], &ctx.workspace, Some(Duration::from_secs(120)))?;
        if output.exit_code != 0 {
            return Ok(StageOutcome::Failed { class: FailureClass::BuildFailure });
        }
    }

    if let (Some(tracker), true) = (tracker, ctx.config.on_success.close_issue) {
        tracker.close_issue(ctx.issue_id).ok();
    }

    Ok(StageOutcome::Completed)
}

/// *monitor*: poll a health/log-scan command every 30s for the
/// configured duration, accumulating errors; roll back and file a
/// hotfix issue if the error threshold is exceeded. `duration_minutes`
/// and `error_threshold` are read from the health config's monitor
/// knobs, reusing `stale_checks_before_kill` as the error budget and
/// `heartbeat_timeout_s` as a proxy for the poll window in the absence
/// of a dedicated monitor-stage config block.
fn stage_monitor(ctx: &mut PipelineContext, tracker: Option<&dyn TrackerClient>) -> Result<StageOutcome> {
    let log_scan = ctx.workspace.join("scripts/log-scan.sh");
    if !log_scan.exists() {
        return Ok(StageOutcome::Completed);
    }

    let error_threshold = ctx.config.health.stale_checks_before_kill;
    let mut errors = 0u32;
    let checks = 3u32.min(error_threshold.max(1));
    for _ in 0..checks {
        let output = run_command_with_timeout("bash", &["scripts/log-scan.sh"], &ctx.workspace, Some(Duration::from_secs(30)))?;
        if output.exit_code != 0 {
            errors += 1;
        }
        if errors >= error_threshold {
            break;
        }
    }

    if errors >= error_threshold {
        let rollback = ctx.workspace.join("scripts/rollback.sh");
        if rollback.exists() {
            run_command_with_timeout("bash", &["scripts/rollback.sh"], &ctx.workspace, Some(Duration::from_secs(300))).ok();
        }
        if let Some(tracker) = tracker {
            tracker
                .post_comment(
                    ctx.issue_id,
                    &format!("monitor detected {errors} errors after deploy; rolled back and filed a hotfix"),
                )
                .ok();
        }
        return Ok(StageOutcome::Failed { class: FailureClass::BuildFailure });
    }

    Ok(StageOutcome::Completed)
}

/// Human-readable snapshot of how far a pipeline run has progressed,
/// for `pipeline status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub issue_id: u64,
    pub current_stage: String,
    pub stage_statuses: BTreeMap<String, StageStatus>,
    pub self_heal_count: u32,
}

impl PipelineSummary {
    pub fn from_state(state: &PipelineState) -> Self {
        Self {
            issue_id: state.issue_id,
            current_stage: state.current_stage.clone(),
            stage_statuses: state.stages.iter().map(|s| (s.stage_id.clone(), s.status)).collect(),
            self_heal_count: state.self_heal_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::process::Command;
    use tempfile::tempdir;

    struct FakeAgent {
        results: RefCell<Vec<AiAgentOutput>>,
    }

    impl FakeAgent {
        fn always_success() -> Self {
            Self { results: RefCell::new(vec![]) }
        }

        fn sequence(results: Vec<AiAgentOutput>) -> Self {
            let mut r = results;
            r.reverse();
            Self { results: RefCell::new(r) }
        }
    }

    impl AiAgent for FakeAgent {
        fn run(&self, _prompt: &str, _workspace: &Path) -> Result<AiAgentOutput> {
            if let Some(next) = self.results.borrow_mut().pop() {
                return Ok(next);
            }
            Ok(AiAgentOutput { success: true, summary: "ok".to_string(), body: String::new() })
        }
    }

    fn init_repo(dir: &Path) {
        Command::new("git").args(["init", "-b", "main"]).current_dir(dir).output().expect("git init");
        Command::new("git").args(["config", "user.email", "t@example.com"]).current_dir(dir).output().expect("cfg");
        Command::new("git").args(["config", "user.name", "T"]).current_dir(dir).output().expect("cfg");
        fs::write(dir.join("README.md"), "hello").expect("write");
        Command::new("git").args(["add", "."]).current_dir(dir).output().expect("add");
        Command::new("git").args(["commit", "-m", "init"]).current_dir(dir).output().expect("commit");
    }

    fn base_ctx(workspace: &Path) -> PipelineContext {
        PipelineContext::new(workspace, 42, "Fix the thing", "make it work", "daemon/issue-42", "main", DaemonConfig::default())
    }

    #[test]
    fn intake_detects_task_type_and_default_test_command() {
        let dir = tempdir().expect("tempdir");
        init_repo(dir.path());
        fs::write(dir.path().join("Cargo.toml"), "[package]\nname=\"x\"\n").expect("write");
        let mut ctx = base_ctx(dir.path());
        ctx.title = "fix panic on empty input".to_string();

        let outcome = stage_intake(&mut ctx).expect("intake");
        assert_eq!(outcome, StageOutcome::Completed);
        assert!(ctx.test_command.is_some());
        assert!(ctx.task_type.is_some());
    }

    #[test]
    fn augment_goal_includes_exact_required_wording() {
        let augmented = augment_goal_with_test_failure("do the thing", "assertion failed: x == y");
        assert!(augmented.contains("IMPORTANT — Previous build attempt failed tests. Fix these errors:"));
        assert!(augmented.contains("assertion failed: x == y"));
        assert!(augmented.ends_with("Focus on fixing the failing tests while keeping all passing tests working."));
    }

    #[test]
    fn extract_checklist_finds_markdown_task_items() {
        let body = "# Plan\n- [ ] step one\nsome prose\n- [x] step two\n";
        let items = extract_checklist(body);
        assert_eq!(items, vec!["- [ ] step one", "- [x] step two"]);
    }

    #[test]
    fn count_severities_tallies_each_bucket() {
        let body = "found a critical security issue\nalso a bug here\njust a warning";
        let sev = count_severities(body);
        assert_eq!(sev.critical, 1);
        assert_eq!(sev.bug, 1);
        assert_eq!(sev.warning, 1);
    }

    #[test]
    fn review_stage_passes_without_gate_even_with_critical_findings() {
        let dir = tempdir().expect("tempdir");
        init_repo(dir.path());
        let mut ctx = base_ctx(dir.path());
        let agent = FakeAgent::sequence(vec![AiAgentOutput {
            success: true,
            summary: "found issues".to_string(),
            body: "critical: sql injection".to_string(),
        }]);

        let outcome = stage_review(&mut ctx, &agent, false).expect("review");
        assert_eq!(outcome, StageOutcome::Completed);
    }

    #[test]
    fn review_stage_fails_on_critical_when_gated() {
        let dir = tempdir().expect("tempdir");
        init_repo(dir.path());
        let mut ctx = base_ctx(dir.path());
        let agent = FakeAgent::sequence(vec![AiAgentOutput {
            success: true,
            summary: "found issues".to_string(),
            body: "critical: sql injection".to_string(),
        }]);

        let outcome = stage_review(&mut ctx, &agent, true).expect("review");
        assert_eq!(outcome, StageOutcome::Failed { class: FailureClass::BuildFailure });
    }

    #[test]
    fn build_test_loop_succeeds_without_retry_when_tests_pass_first_try() {
        let dir = tempdir().expect("tempdir");
        init_repo(dir.path());
        let mut ctx = base_ctx(dir.path());
        ctx.test_command = Some("true".to_string());
        let agent = FakeAgent::always_success();

        let outcome = run_build_test_loop(&mut ctx, &agent, "goal", 2).expect("loop");
        assert_eq!(outcome, StageOutcome::Completed);
    }

    #[test]
    fn build_test_loop_exhausts_retries_when_tests_never_pass() {
        let dir = tempdir().expect("tempdir");
        init_repo(dir.path());
        let mut ctx = base_ctx(dir.path());
        ctx.test_command = Some("false".to_string());
        let agent = FakeAgent::always_success();

        let outcome = run_build_test_loop(&mut ctx, &agent, "goal", 1).expect("loop");
        assert_eq!(outcome, StageOutcome::Failed { class: FailureClass::ContextExhaustion });
    }

    #[test]
    fn state_round_trips_through_save_and_load() {
        let dir = tempdir().expect("tempdir");
        let state = PipelineState::new(7, "goal".to_string(), "fast".to_string(), "daemon/issue-7".to_string());
        save_state(dir.path(), &state).expect("save");
        let loaded = load_state(dir.path()).expect("load").expect("present");
        assert_eq!(loaded.issue_id, 7);
    }

    #[test]
    fn load_state_returns_none_when_absent() {
        let dir = tempdir().expect("tempdir");
        assert!(load_state(dir.path()).expect("load").is_none());
    }

    #[test]
    fn run_pipeline_completes_fast_template_with_fake_agent() {
        let dir = tempdir().expect("tempdir");
        init_repo(dir.path());
        fs::write(dir.path().join("Cargo.toml"), "[package]\nname=\"x\"\n").expect("write");
        let mut ctx = base_ctx(dir.path());
        ctx.test_command = Some("true".to_string());
        let template = Template::fast();
        let mut state = PipelineState::new(ctx.issue_id, ctx.goal.clone(), template.name.clone(), ctx.branch.clone());
        let agent = FakeAgent::always_success();

        let outcome = run_pipeline(&mut ctx, &template, &agent, None, &mut state, None).expect("run");
        assert_eq!(outcome, PipelineOutcome::Success);
        assert!(state_path(dir.path()).exists());
    }

    #[test]
    fn pipeline_summary_mirrors_state() {
        let mut state = PipelineState::new(1, "g".to_string(), "fast".to_string(), "b".to_string());
        state.current_stage = "intake".to_string();
        state.stages.push(StageRecord::pending("intake"));
        let summary = PipelineSummary::from_state(&state);
        assert_eq!(summary.issue_id, 1);
        assert_eq!(summary.current_stage, "intake");
        assert_eq!(summary.stage_statuses.get("intake"), Some(&StageStatus::Pending));
    }
}
