//! `cleanup [--force]`: remove orphaned worktrees, stale
//! heartbeat/progress files, and dead branches left over from jobs the
//! daemon no longer tracks. Without `--force` this only reports what it
//! would remove.

use std::collections::HashSet;

use anyhow::Result;
use shipwright_state::StateStore;
use shipwright_supervisor::paths::Paths;
use shipwright_worktree::WorktreeManager;

pub fn run(repo_root: std::path::PathBuf, force: bool) -> Result<()> {
    let home = shipwright_supervisor::paths::default_home();
    let paths = Paths::new(home, repo_root.clone());
    let state = StateStore::new(paths.state_dir()).load().unwrap_or_else(|_| shipwright_state::DaemonState::new(std::process::id()));

    let tracked: HashSet<u64> = state
        .active_jobs
        .iter()
        .map(|j| j.issue_id)
        .chain(state.queued.iter().map(|q| q.issue_id))
        .collect();

    let mut removed = 0usize;

    let worktrees_root = paths.worktrees_root();
    if let Ok(entries) = std::fs::read_dir(&worktrees_root) {
        let manager = WorktreeManager::default_for_repo(&repo_root);
        for entry in entries.flatten() {
            let Some(issue_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("daemon-issue-"))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            if tracked.contains(&issue_id) {
                continue;
            }
            println!("orphaned worktree: issue #{issue_id}");
            if force {
                manager.teardown(issue_id, false)?;
                removed += 1;
            }
        }
    }

    for dir in [paths.heartbeats_dir(), paths.progress_dir(), paths.logs_dir()] {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let Some(issue_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("issue-"))
                .and_then(|name| name.split('.').next())
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            if tracked.contains(&issue_id) {
                continue;
            }
            println!("stale file: {}", entry.path().display());
            if force {
                let _ = std::fs::remove_file(entry.path());
                removed += 1;
            }
        }
    }

    if !force && removed == 0 {
        println!("(dry run — pass --force to actually remove these)");
    } else if force {
        println!("removed {removed} orphaned item(s)");
    }
    Ok(())
}
