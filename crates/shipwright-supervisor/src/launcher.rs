//! Worker process launching.
//!
//! The supervisor spawns one child process per [`Job`](shipwright_types::Job)
//! and never links the stage executor in-process: a panic or infinite loop
//! in one pipeline must not be able to take the daemon down with it. The
//! production launcher re-execs the daemon's own binary with a hidden
//! worker subcommand; tests substitute a [`WorkerLauncher`] that never
//! shells out at all.

use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use anyhow::{Context, Result};

/// Everything a launched worker needs on its command line. Kept as plain
/// strings/paths rather than a `Job` so the launcher doesn't need to know
/// about state-store types.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub issue_id: u64,
    pub workspace: PathBuf,
    pub repo_root: PathBuf,
    pub template: String,
    pub goal: String,
    pub title: String,
    pub branch: String,
    pub base_branch: String,
    pub config_path: PathBuf,
    pub log_file: PathBuf,
    pub resume: bool,
    /// Set on escalated retries: overrides the configured model
    /// with the most capable one available.
    pub model_override: Option<String>,
}

/// Spawns the process that will run one job's pipeline end to end.
/// Implementations must return immediately (non-blocking) with a handle
/// the supervisor can `try_wait`/`kill` later.
pub trait WorkerLauncher {
    fn spawn(&self, spec: &WorkerSpec) -> Result<Child>;
}

/// Re-execs `current_exe pipeline run-worker ...`, redirecting stdout and
/// stderr to the job's per-issue log file so `daemon logs` and the
/// reaper's reparented-exit log-tail parse both work off the same file.
pub struct SelfExecLauncher {
    pub current_exe: PathBuf,
}

impl SelfExecLauncher {
    pub fn new() -> Result<Self> {
        let current_exe = std::env::current_exe().context("failed to resolve current executable")?;
        Ok(Self { current_exe })
    }
}

impl WorkerLauncher for SelfExecLauncher {
    fn spawn(&self, spec: &WorkerSpec) -> Result<Child> {
        if let Some(parent) = spec.log_file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log dir {}", parent.display()))?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_file)
            .with_context(|| format!("failed to open log file {}", spec.log_file.display()))?;
        let log_err = log
            .try_clone()
            .context("failed to duplicate log file handle for stderr")?;

        let mut cmd = Command::new(&self.current_exe);
        cmd.arg("pipeline")
            .arg("run-worker")
            .arg("--issue")
            .arg(spec.issue_id.to_string())
            .arg("--workspace")
            .arg(&spec.workspace)
            .arg("--repo-root")
            .arg(&spec.repo_root)
            .arg("--template")
            .arg(&spec.template)
            .arg("--title")
            .arg(&spec.title)
            .arg("--goal")
            .arg(&spec.goal)
            .arg("--branch")
            .arg(&spec.branch)
            .arg("--base-branch")
            .arg(&spec.base_branch)
            .arg("--config")
            .arg(&spec.config_path)
            .arg("--log-file")
            .arg(&spec.log_file);

        if spec.resume {
            cmd.arg("--resume");
        }
        if let Some(model) = &spec.model_override {
            cmd.arg("--model").arg(model);
        }

        cmd.stdout(log).stderr(log_err);

        cmd.spawn()
            .with_context(|| format!("failed to spawn worker for issue #{}", spec.issue_id))
    }
}

/// Canonical success/failure markers a worker process appends to its log
/// file as the very last line before exiting. `wait()` returning a
/// reparented exit status (historically 127) cannot be trusted as
/// success, so the reaper falls back to this marker (subprocess
/// reparenting").
pub const SUCCESS_MARKER: &str = "SHIPWRIGHT_PIPELINE_RESULT=success";
pub const FAILURE_MARKER_PREFIX: &str = "SHIPWRIGHT_PIPELINE_RESULT=failure:";

pub fn success_marker_line() -> String {
    format!("{SUCCESS_MARKER}\n")
}

pub fn failure_marker_line(class: shipwright_retry::FailureClass) -> String {
    format!("{FAILURE_MARKER_PREFIX}{class:?}\n")
}

/// Parse the canonical marker from a log tail, defaulting to failure
/// when ambiguous (no marker found at all).
pub fn parse_outcome_marker(log_tail: &str) -> Option<bool> {
    for line in log_tail.lines().rev() {
        let line = line.trim();
        if line == SUCCESS_MARKER {
            return Some(true);
        }
        if line.starts_with(FAILURE_MARKER_PREFIX) {
            return Some(false);
        }
    }
    None
}

/// Read the last `max_bytes` of a log file, for classification and
/// marker parsing. Missing files read as empty rather than erroring —
/// a worker that never got to write anything is itself informative.
pub fn read_log_tail(path: &Path, max_bytes: u64) -> String {
    use std::io::{Read, Seek, SeekFrom};

    let Ok(mut file) = std::fs::File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(max_bytes);
    if file.seek(SeekFrom::Start(start)).is_err() {
        return String::new();
    }
    let mut buf = String::new();
    let _ = file.read_to_string(&mut buf);
    buf
}
