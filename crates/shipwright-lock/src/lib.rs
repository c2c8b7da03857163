//! Advisory file locking shared by the state store and the worktree
//! manager.
//!
//! The lock file holds JSON metadata about the lock holder (pid, hostname,
//! acquired_at, purpose) so a human can `cat` it during an incident. Callers
//! that only need "is someone else holding this" bail immediately; callers
//! that need to serialize a queue of writers use [`LockFile::acquire_bounded`]
//! which retries until a configurable timeout elapses, matching the "acquire
//! lock with bounded timeout" contract the state store and worktree manager
//! both rely on.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LOCK_FILE: &str = "lock";

/// Information stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    /// Free-form description of what is being locked (e.g. an issue id).
    pub purpose: Option<String>,
}

/// A held lock file; released on `Drop` (best-effort).
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Try to acquire the lock once. Fails immediately if already held.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let lock_path = dir.join(LOCK_FILE);
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create lock dir {}", dir.display()))?;

        if lock_path.exists() {
            let existing = read_lock_info(&lock_path)?;
            bail!(
                "lock already held by pid {} on {} since {} (purpose: {:?})",
                existing.pid,
                existing.hostname,
                existing.acquired_at,
                existing.purpose
            );
        }

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
            purpose: None,
        };
        write_lock_atomic(&lock_path, &info)?;

        Ok(Self { path: lock_path })
    }

    /// Acquire the lock, taking over a stale lock (older than `stale_after`)
    /// if one is found.
    pub fn acquire_with_staleness(dir: &Path, stale_after: Duration) -> Result<Self> {
        let lock_path = dir.join(LOCK_FILE);
        if lock_path.exists() {
            match read_lock_info(&lock_path) {
                Ok(info) => {
                    let age = Utc::now() - info.acquired_at;
                    if age.num_seconds().unsigned_abs() > stale_after.as_secs() {
                        fs::remove_file(&lock_path).with_context(|| {
                            format!("failed to remove stale lock {}", lock_path.display())
                        })?;
                    } else {
                        bail!(
                            "lock already held by pid {} on {} since {} (age: {:?})",
                            info.pid,
                            info.hostname,
                            info.acquired_at,
                            age
                        );
                    }
                }
                Err(_) => {
                    fs::remove_file(&lock_path).with_context(|| {
                        format!("failed to remove corrupt lock {}", lock_path.display())
                    })?;
                }
            }
        }
        Self::acquire(dir)
    }

    /// Retry acquisition until `timeout` elapses. This is the primitive the
    /// state store uses with a 5s timeout and the worktree manager uses with
    /// a 30s timeout; both treat a timed-out acquisition as a soft failure
    /// (log and skip this cycle), never a panic.
    pub fn acquire_bounded(dir: &Path, timeout: Duration, purpose: Option<&str>) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        let retry_delay = Duration::from_millis(100);
        loop {
            match Self::acquire(dir) {
                Ok(mut lock) => {
                    if let Some(p) = purpose {
                        lock.set_purpose(p)?;
                    }
                    return Ok(lock);
                }
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(e.context(format!(
                            "lock acquisition timed out after {timeout:?} on {}",
                            dir.display()
                        )));
                    }
                    std::thread::sleep(retry_delay.min(
                        deadline.saturating_duration_since(Instant::now()),
                    ));
                }
            }
        }
    }

    pub fn release(&mut self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove lock {}", self.path.display()))?;
        }
        Ok(())
    }

    pub fn set_purpose(&self, purpose: &str) -> Result<()> {
        let mut info = read_lock_info(&self.path)?;
        info.purpose = Some(purpose.to_string());
        write_lock_atomic(&self.path, &info)
    }

    pub fn is_locked(dir: &Path) -> bool {
        dir.join(LOCK_FILE).exists()
    }

    pub fn read_info(dir: &Path) -> Result<LockInfo> {
        read_lock_info(&dir.join(LOCK_FILE))
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn write_lock_atomic(path: &Path, info: &LockInfo) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(info).context("failed to serialize lock info")?;
    {
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to create lock tmp file {}", tmp.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write lock tmp file {}", tmp.display()))?;
        file.sync_all().context("failed to sync lock file")?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename lock file into place at {}", path.display()))?;
    Ok(())
}

fn read_lock_info(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse lock JSON from {}", path.display()))
}

pub fn lock_path(dir: &Path) -> PathBuf {
    dir.join(LOCK_FILE)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn acquire_and_release_roundtrip() {
        let td = tempdir().unwrap();
        let mut lock = LockFile::acquire(td.path()).unwrap();
        assert!(LockFile::is_locked(td.path()));
        lock.release().unwrap();
        assert!(!LockFile::is_locked(td.path()));
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let td = tempdir().unwrap();
        let _lock = LockFile::acquire(td.path()).unwrap();
        let err = LockFile::acquire(td.path()).unwrap_err();
        assert!(err.to_string().contains("already held"));
    }

    #[test]
    fn drop_releases() {
        let td = tempdir().unwrap();
        {
            let _lock = LockFile::acquire(td.path()).unwrap();
            assert!(LockFile::is_locked(td.path()));
        }
        assert!(!LockFile::is_locked(td.path()));
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let td = tempdir().unwrap();
        let old = LockInfo {
            pid: 999_999,
            hostname: "old-host".into(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            purpose: None,
        };
        write_lock_atomic(&lock_path(td.path()), &old).unwrap();

        let lock = LockFile::acquire_with_staleness(td.path(), Duration::from_secs(3600)).unwrap();
        let info = LockFile::read_info(td.path()).unwrap();
        assert_eq!(info.pid, std::process::id());
        drop(lock);
    }

    #[test]
    fn fresh_lock_is_not_taken_over() {
        let td = tempdir().unwrap();
        let _holder = LockFile::acquire(td.path()).unwrap();
        let err =
            LockFile::acquire_with_staleness(td.path(), Duration::from_secs(3600)).unwrap_err();
        assert!(err.to_string().contains("already held"));
    }

    #[test]
    fn acquire_bounded_times_out_when_held() {
        let td = tempdir().unwrap();
        let _holder = LockFile::acquire(td.path()).unwrap();
        let start = Instant::now();
        let err = LockFile::acquire_bounded(td.path(), Duration::from_millis(300), None)
            .unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn acquire_bounded_succeeds_once_released() {
        let td = tempdir().unwrap();
        let holder = LockFile::acquire(td.path()).unwrap();
        let dir = td.path().to_path_buf();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            drop(holder);
        });
        let lock =
            LockFile::acquire_bounded(td.path(), Duration::from_secs(2), Some("issue-42"))
                .unwrap();
        handle.join().unwrap();
        let info = LockFile::read_info(td.path()).unwrap();
        assert_eq!(info.purpose.as_deref(), Some("issue-42"));
        drop(lock);
    }
}
