//! Progress sensing for active Shipwright pipelines.
//!
//! Once per poll cycle the supervisor asks this crate for a fresh
//! [`ProgressSnapshot`] of each active job's workspace, folds it into
//! the job's [`ProgressHistory`], and asks [`assess_verdict`] what the
//! job's health looks like. [`decide_response`] then turns that verdict
//! into one of three actions: keep watching, nudge once, or kill.
//!
//! The heartbeat file and the workspace's own pipeline-state file can
//! disagree about which stage/iteration a job is on — the heartbeat is
//! written by the stage executor itself and is trusted over whatever
//! the workspace file says, by design, not by accident.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipwright_types::{ProgressHistory, ProgressSnapshot, ProgressVerdict};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Heartbeat file a stage executor writes on every meaningful step,
/// keyed by the executor's own pid so a reparented/orphaned process is
/// still attributable. Lives at `heartbeats/<job>.json` under the
/// daemon home.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub pid: u32,
    pub stage: String,
    pub iteration: u32,
    pub ts: DateTime<Utc>,
}

fn read_heartbeat(path: &Path) -> Option<Heartbeat> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Minimal view of the workspace's own pipeline-state document, read
/// only for its `current_stage` and `self_heal_count` fields; the full
/// document lives in `shipwright-pipeline`.
#[derive(Debug, Deserialize)]
struct WorkspaceStageView {
    current_stage: String,
    #[serde(default)]
    self_heal_count: u32,
}

fn read_workspace_stage(path: &Path) -> Option<(String, u32)> {
    let content = fs::read_to_string(path).ok()?;
    let view: WorkspaceStageView = serde_json::from_str(&content).ok()?;
    Some((view.current_stage, view.self_heal_count))
}

/// `git diff --stat` line count and untracked-file count for `workspace`.
/// Missing/non-git directories degrade to `(0, 0)` rather than erroring;
/// a worktree mid-setup or already cleaned up is not a sensor failure.
fn diff_stats(workspace: &Path) -> (u64, u32) {
    let diff_lines = std::process::Command::new("git")
        .args(["-C"])
        .arg(workspace)
        .args(["diff", "--numstat"])
        .output()
        .ok()
        .map(|out| {
            String::from_utf8_lossy(&out.stdout)
                .lines()
                .filter_map(|line| {
                    let mut fields = line.split_whitespace();
                    let added: u64 = fields.next()?.parse().unwrap_or(0);
                    let removed: u64 = fields.next()?.parse().unwrap_or(0);
                    Some(added + removed)
                })
                .sum()
        })
        .unwrap_or(0);

    let files_changed = std::process::Command::new("git")
        .args(["-C"])
        .arg(workspace)
        .args(["status", "--porcelain"])
        .output()
        .ok()
        .map(|out| String::from_utf8_lossy(&out.stdout).lines().count() as u32)
        .unwrap_or(0);

    (diff_lines, files_changed)
}

/// The signature used to detect a repeating error: the first non-blank
/// line of the workspace's error log tail, trimmed. `None` if the log
/// is absent or empty, which is treated as "no error" rather than "a
/// repeated empty error".
fn last_error_signature(error_log: &Path) -> Option<String> {
    let content = fs::read_to_string(error_log).ok()?;
    content
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_string())
}

/// Collect one [`ProgressSnapshot`] of `workspace`. `heartbeat_path` and
/// `pipeline_state_path` may each be absent; when both are present and
/// disagree on stage, the heartbeat's value wins.
pub fn collect_snapshot(
    workspace: &Path,
    heartbeat_path: &Path,
    pipeline_state_path: &Path,
    error_log_path: &Path,
) -> ProgressSnapshot {
    let heartbeat = read_heartbeat(heartbeat_path);
    let workspace_stage = read_workspace_stage(pipeline_state_path);

    let (stage, iteration) = match (&heartbeat, &workspace_stage) {
        (Some(hb), _) => (hb.stage.clone(), hb.iteration),
        (None, Some((stage, iteration))) => (stage.clone(), *iteration),
        (None, None) => (String::new(), 0),
    };

    let (diff_lines, files_changed) = diff_stats(workspace);

    ProgressSnapshot {
        stage,
        iteration,
        diff_lines,
        files_changed,
        last_error_signature: last_error_signature(error_log_path),
        ts: Utc::now(),
    }
}

/// A richer externally supplied health score, when the executor
/// produces one (e.g. parsed from model-reported step counts). Absent
/// for most stages, which fall back to the counter thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VitalsVerdict {
    Continue,
    Warn,
    Intervene,
    Abort,
}

impl From<VitalsVerdict> for ProgressVerdict {
    fn from(v: VitalsVerdict) -> Self {
        match v {
            VitalsVerdict::Continue => ProgressVerdict::Healthy,
            VitalsVerdict::Warn => ProgressVerdict::Slowing,
            VitalsVerdict::Intervene => ProgressVerdict::Stalled,
            VitalsVerdict::Abort => ProgressVerdict::Stuck,
        }
    }
}

/// Fold a new snapshot into `history` (pushing it onto the ring and
/// updating the no-progress/repeated-error counters) and return the
/// resulting verdict, per the ordered mapping below:
/// `repeated_error_count >= 3` always wins; otherwise a supplied
/// `vitals` verdict is used; otherwise the counters are compared
/// against `kill_threshold`/`warn_threshold`.
pub fn assess_verdict(
    history: &mut ProgressHistory,
    snapshot: ProgressSnapshot,
    cpu_active: bool,
    vitals: Option<VitalsVerdict>,
    kill_threshold: u32,
    warn_threshold: u32,
) -> ProgressVerdict {
    let progressed = match history.latest() {
        Some(prev) => {
            prev.stage != snapshot.stage
                || prev.iteration != snapshot.iteration
                || snapshot.diff_lines > prev.diff_lines
                || snapshot.files_changed > prev.files_changed
                || cpu_active
        }
        None => true,
    };

    let same_error = history
        .latest()
        .is_some_and(|prev| prev.last_error_signature == snapshot.last_error_signature && snapshot.last_error_signature.is_some());

    if progressed {
        history.no_progress_count = 0;
        history.repeated_error_count = 0;
    } else {
        history.no_progress_count += 1;
    }

    if same_error {
        history.repeated_error_count += 1;
    } else {
        history.repeated_error_count = 0;
    }

    history.push(snapshot);

    if history.repeated_error_count >= 3 {
        return ProgressVerdict::Stuck;
    }
    if let Some(vitals) = vitals {
        return vitals.into();
    }
    if history.no_progress_count >= kill_threshold {
        ProgressVerdict::Stuck
    } else if history.no_progress_count >= warn_threshold {
        ProgressVerdict::Stalled
    } else if history.no_progress_count >= 1 {
        ProgressVerdict::Slowing
    } else {
        ProgressVerdict::Healthy
    }
}

/// The supervisor's reaction to a progress verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Nothing to do; keep monitoring.
    Continue,
    /// Write a one-time advisory nudge file into the workspace.
    Nudge,
    /// Kill the worker's process tree.
    Kill,
}

/// Deliberately patient: a `stuck` verdict alone is not enough. The
/// worker is only killed when it is *also* burning zero CPU and has
/// gone twice the kill threshold with no progress, or when errors have
/// repeated five times regardless of CPU activity. A `stuck` worker
/// that's still working gets nudged (once) rather than killed.
pub fn decide_response(
    verdict: ProgressVerdict,
    cpu_active: bool,
    no_progress_count: u32,
    repeated_error_count: u32,
    kill_threshold: u32,
    nudge_already_sent: bool,
) -> Response {
    if repeated_error_count >= 5 {
        return Response::Kill;
    }
    if verdict == ProgressVerdict::Stuck && !cpu_active && no_progress_count >= 2 * kill_threshold {
        return Response::Kill;
    }
    if verdict == ProgressVerdict::Stuck && !nudge_already_sent {
        return Response::Nudge;
    }
    Response::Continue
}

/// Whether any process in `pid`'s tree (just `pid` itself, in the
/// common single-process worker case) has nonzero CPU usage since the
/// last refresh. `sysinfo` requires two refreshes spaced apart to
/// report nonzero usage on the first call, so callers that need a
/// reliable first reading should refresh once, sleep briefly, and
/// refresh again before calling this.
pub fn cpu_active(system: &mut System, pid: u32) -> bool {
    system.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    system
        .process(Pid::from_u32(pid))
        .map(|p| p.cpu_usage() > 0.0)
        .unwrap_or(false)
}

pub const NUDGE_FILE: &str = "DAEMON_NUDGE.md";

/// Write the one-time nudge advisory into `workspace`, unless one is
/// already present. Returns whether it actually wrote (the supervisor
/// uses this to flip its own `nudge_already_sent` bit).
pub fn write_nudge_once(workspace: &Path) -> Result<bool> {
    let path = workspace.join(NUDGE_FILE);
    if path.exists() {
        return Ok(false);
    }
    fs::write(
        &path,
        "# Progress nudge\n\n\
         The supervisor hasn't observed forward progress on this pipeline for a while, \
         but your process tree is still active, so it is not being killed. \
         Consider committing incremental progress or narrowing scope.\n",
    )
    .with_context(|| format!("failed to write nudge file at {}", path.display()))?;
    Ok(true)
}

/// Hard wall-clock limit check, disabled by default. `started_at`
/// is the job's spawn time; `limit` is `health.hard_limit_s` if set.
pub fn hard_limit_exceeded(started_at: DateTime<Utc>, limit: Option<Duration>) -> bool {
    match limit {
        Some(limit) => {
            let elapsed = Utc::now().signed_duration_since(started_at);
            elapsed.to_std().map(|e| e >= limit).unwrap_or(false)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_types::ProgressHistory;
    use tempfile::tempdir;

    fn snapshot(stage: &str, iteration: u32, diff_lines: u64, files_changed: u32, err: Option<&str>) -> ProgressSnapshot {
        ProgressSnapshot {
            stage: stage.to_string(),
            iteration,
            diff_lines,
            files_changed,
            last_error_signature: err.map(str::to_string),
            ts: Utc::now(),
        }
    }

    #[test]
    fn first_snapshot_is_always_healthy() {
        let mut history = ProgressHistory::default();
        let verdict = assess_verdict(&mut history, snapshot("build", 0, 0, 0, None), false, None, 6, 3);
        assert_eq!(verdict, ProgressVerdict::Healthy);
        assert_eq!(history.no_progress_count, 0);
    }

    #[test]
    fn stalled_progress_counts_up_to_warn_then_kill() {
        let mut history = ProgressHistory::default();
        assess_verdict(&mut history, snapshot("build", 1, 10, 1, None), false, None, 6, 3);
        for _ in 0..2 {
            assess_verdict(&mut history, snapshot("build", 1, 10, 1, None), false, None, 6, 3);
        }
        assert_eq!(history.no_progress_count, 2);
        let verdict = assess_verdict(&mut history, snapshot("build", 1, 10, 1, None), false, None, 6, 3);
        assert_eq!(verdict, ProgressVerdict::Stalled);
    }

    #[test]
    fn growing_diff_resets_no_progress_count() {
        let mut history = ProgressHistory::default();
        assess_verdict(&mut history, snapshot("build", 1, 10, 1, None), false, None, 6, 3);
        assess_verdict(&mut history, snapshot("build", 1, 10, 1, None), false, None, 6, 3);
        assert_eq!(history.no_progress_count, 1);
        assess_verdict(&mut history, snapshot("build", 1, 20, 2, None), false, None, 6, 3);
        assert_eq!(history.no_progress_count, 0);
    }

    #[test]
    fn repeated_error_count_forces_stuck_regardless_of_threshold() {
        let mut history = ProgressHistory::default();
        for _ in 0..4 {
            assess_verdict(
                &mut history,
                snapshot("test", 1, 10, 1, Some("panic at src/lib.rs:42")),
                false,
                None,
                60,
                30,
            );
        }
        assert_eq!(history.repeated_error_count, 4);
        let verdict = assess_verdict(
            &mut history,
            snapshot("test", 1, 10, 1, Some("panic at src/lib.rs:42")),
            false,
            None,
            60,
            30,
        );
        assert_eq!(verdict, ProgressVerdict::Stuck);
    }

    #[test]
    fn different_error_signature_resets_repeated_count() {
        let mut history = ProgressHistory::default();
        assess_verdict(&mut history, snapshot("test", 1, 10, 1, Some("err a")), false, None, 6, 3);
        assess_verdict(&mut history, snapshot("test", 1, 10, 1, Some("err a")), false, None, 6, 3);
        assert_eq!(history.repeated_error_count, 2);
        assess_verdict(&mut history, snapshot("test", 1, 10, 1, Some("err b")), false, None, 6, 3);
        assert_eq!(history.repeated_error_count, 0);
    }

    #[test]
    fn vitals_verdict_overrides_counters_when_present() {
        let mut history = ProgressHistory::default();
        let verdict = assess_verdict(
            &mut history,
            snapshot("build", 1, 0, 0, None),
            false,
            Some(VitalsVerdict::Intervene),
            6,
            3,
        );
        assert_eq!(verdict, ProgressVerdict::Stalled);
    }

    #[test]
    fn stuck_with_live_cpu_never_kills_only_nudges_once() {
        assert_eq!(
            decide_response(ProgressVerdict::Stuck, true, 12, 0, 6, false),
            Response::Nudge
        );
        assert_eq!(
            decide_response(ProgressVerdict::Stuck, true, 12, 0, 6, true),
            Response::Continue
        );
    }

    #[test]
    fn stuck_with_zero_cpu_and_double_threshold_kills() {
        assert_eq!(
            decide_response(ProgressVerdict::Stuck, false, 12, 0, 6, false),
            Response::Kill
        );
        assert_eq!(
            decide_response(ProgressVerdict::Stuck, false, 11, 0, 6, false),
            Response::Nudge
        );
    }

    #[test]
    fn five_repeated_errors_kill_even_with_live_cpu() {
        assert_eq!(
            decide_response(ProgressVerdict::Stuck, true, 0, 5, 6, false),
            Response::Kill
        );
    }

    #[test]
    fn heartbeat_wins_over_workspace_file_on_disagreement() {
        let td = tempdir().expect("tempdir");
        let heartbeat_path = td.path().join("hb.json");
        let state_path = td.path().join("state.json");
        let error_path = td.path().join("error.log");

        fs::write(
            &heartbeat_path,
            r#"{"pid": 123, "stage": "test", "iteration": 4, "ts": "2026-01-01T00:00:00Z"}"#,
        )
        .expect("write heartbeat");
        fs::write(&state_path, r#"{"current_stage": "build", "self_heal_count": 1}"#)
            .expect("write state");

        let snapshot = collect_snapshot(td.path(), &heartbeat_path, &state_path, &error_path);
        assert_eq!(snapshot.stage, "test");
        assert_eq!(snapshot.iteration, 4);
    }

    #[test]
    fn workspace_file_used_when_heartbeat_absent() {
        let td = tempdir().expect("tempdir");
        let heartbeat_path = td.path().join("hb.json");
        let state_path = td.path().join("state.json");
        let error_path = td.path().join("error.log");

        fs::write(&state_path, r#"{"current_stage": "review", "self_heal_count": 2}"#)
            .expect("write state");

        let snapshot = collect_snapshot(td.path(), &heartbeat_path, &state_path, &error_path);
        assert_eq!(snapshot.stage, "review");
        assert_eq!(snapshot.iteration, 2);
    }

    #[test]
    fn nudge_file_is_written_once() {
        let td = tempdir().expect("tempdir");
        assert!(write_nudge_once(td.path()).expect("first write"));
        assert!(!write_nudge_once(td.path()).expect("second write is a no-op"));
    }

    #[test]
    fn hard_limit_disabled_by_default() {
        assert!(!hard_limit_exceeded(Utc::now(), None));
    }
}
