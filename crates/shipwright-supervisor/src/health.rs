//! Per-job progress health supervision, wiring `shipwright-progress`
//! sensor/verdict/response functions to one active job's on-disk state.

use std::path::Path;

use chrono::{DateTime, Utc};
use shipwright_config::HealthConfig;
use shipwright_progress::{assess_verdict, collect_snapshot, cpu_active, decide_response, hard_limit_exceeded, write_nudge_once, Response};
use shipwright_types::{ProgressHistory, ProgressVerdict};
use sysinfo::System;

use crate::paths::Paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheck {
    pub verdict: ProgressVerdict,
    pub response: Response,
}

/// Refresh one job's progress history and decide what, if anything, the
/// supervisor should do about it. `nudge_already_sent` and `history` are
/// mutated in place; the caller owns their lifetime across cycles.
pub fn check_job_health(
    paths: &Paths,
    issue_id: u64,
    workspace: &Path,
    started_at: DateTime<Utc>,
    pid: u32,
    history: &mut ProgressHistory,
    nudge_already_sent: &mut bool,
    system: &mut System,
    config: &HealthConfig,
) -> HealthCheck {
    if hard_limit_exceeded(started_at, config.hard_limit_s.map(|d| d.0)) {
        return HealthCheck {
            verdict: ProgressVerdict::Stuck,
            response: Response::Kill,
        };
    }

    let heartbeat_path = paths.heartbeat_file(issue_id);
    let pipeline_state_path = shipwright_pipeline::state_path(workspace);
    let error_log_path = paths.log_file(issue_id);

    let snapshot = collect_snapshot(workspace, &heartbeat_path, &pipeline_state_path, &error_log_path);
    let active = if config.progress_based {
        cpu_active(system, pid)
    } else {
        false
    };

    let verdict = assess_verdict(
        history,
        snapshot,
        active,
        None,
        config.stale_checks_before_kill,
        config.stale_checks_before_warn,
    );

    let response = decide_response(
        verdict,
        active,
        history.no_progress_count,
        history.repeated_error_count,
        config.stale_checks_before_kill,
        *nudge_already_sent,
    );

    if response == Response::Nudge && config.nudge_enabled {
        if write_nudge_once(workspace).unwrap_or(false) {
            *nudge_already_sent = true;
        }
    }

    HealthCheck { verdict, response }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_config::HealthConfig;
    use tempfile::tempdir;

    #[test]
    fn hard_limit_kills_regardless_of_progress_state() {
        let paths = Paths::new("/home", "/repo");
        let td = tempdir().expect("tempdir");
        let mut history = ProgressHistory::default();
        let mut nudge_sent = false;
        let mut system = System::new();
        let mut config = HealthConfig::default();
        config.hard_limit_s = Some(shipwright_duration::DurationSecs(std::time::Duration::from_secs(1)));

        let started_at = Utc::now() - chrono::Duration::seconds(10);
        let check = check_job_health(
            &paths,
            1,
            td.path(),
            started_at,
            std::process::id(),
            &mut history,
            &mut nudge_sent,
            &mut system,
            &config,
        );
        assert_eq!(check.response, Response::Kill);
    }

    #[test]
    fn fresh_job_with_no_history_is_healthy() {
        let paths = Paths::new("/home", "/repo");
        let td = tempdir().expect("tempdir");
        let mut history = ProgressHistory::default();
        let mut nudge_sent = false;
        let mut system = System::new();
        let config = HealthConfig::default();

        let check = check_job_health(
            &paths,
            1,
            td.path(),
            Utc::now(),
            std::process::id(),
            &mut history,
            &mut nudge_sent,
            &mut system,
            &config,
        );
        assert_eq!(check.verdict, ProgressVerdict::Healthy);
        assert_eq!(check.response, Response::Continue);
    }
}
