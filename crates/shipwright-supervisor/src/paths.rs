//! Filesystem layout under `<HOME>/.shipwright`.
//!
//! Every other supervisor module takes a `&Paths` rather than rebuilding
//! these joins itself, so the layout is defined exactly once.

use std::path::{Path, PathBuf};

/// Resolve the Shipwright home directory: explicit override, then
/// `$SHIPWRIGHT_HOME`, then `~/.shipwright`. Thin wrapper so supervisor
/// code doesn't need to depend on `shipwright-auth` just for this.
pub fn default_home() -> PathBuf {
    shipwright_auth::shipwright_home_path(None)
}

#[derive(Debug, Clone)]
pub struct Paths {
    /// `<HOME>/.shipwright` (or an override, e.g. for tests).
    pub home: PathBuf,
    /// The repository the daemon is driving pipelines against.
    pub repo_root: PathBuf,
}

impl Paths {
    pub fn new(home: impl Into<PathBuf>, repo_root: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            repo_root: repo_root.into(),
        }
    }

    pub fn pid_file(&self) -> PathBuf {
        self.home.join("daemon.pid")
    }

    pub fn shutdown_flag(&self) -> PathBuf {
        self.home.join("daemon.shutdown")
    }

    pub fn pause_flag(&self) -> PathBuf {
        self.home.join("daemon-pause.flag")
    }

    /// State-store/event-log/baseline/adaptive root; these crates all
    /// take this directory directly and join their own filenames under it.
    pub fn state_dir(&self) -> &Path {
        &self.home
    }

    pub fn heartbeats_dir(&self) -> PathBuf {
        self.home.join("heartbeats")
    }

    pub fn heartbeat_file(&self, issue_id: u64) -> PathBuf {
        self.heartbeats_dir().join(format!("issue-{issue_id}.json"))
    }

    pub fn progress_dir(&self) -> PathBuf {
        self.home.join("progress")
    }

    pub fn progress_file(&self, issue_id: u64) -> PathBuf {
        self.progress_dir().join(format!("issue-{issue_id}.json"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn log_file(&self, issue_id: u64) -> PathBuf {
        self.logs_dir().join(format!("issue-{issue_id}.log"))
    }

    pub fn worktrees_root(&self) -> PathBuf {
        self.repo_root.join(".worktrees")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_join_under_home() {
        let paths = Paths::new("/home/.shipwright", "/repo");
        assert_eq!(paths.pid_file(), PathBuf::from("/home/.shipwright/daemon.pid"));
        assert_eq!(paths.heartbeat_file(42), PathBuf::from("/home/.shipwright/heartbeats/issue-42.json"));
        assert_eq!(paths.progress_file(42), PathBuf::from("/home/.shipwright/progress/issue-42.json"));
        assert_eq!(paths.log_file(42), PathBuf::from("/home/.shipwright/logs/issue-42.log"));
        assert_eq!(paths.worktrees_root(), PathBuf::from("/repo/.worktrees"));
    }
}
