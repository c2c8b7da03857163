//! Worktree manager for the Shipwright daemon.
//!
//! Creates an isolated workspace per job under
//! `.worktrees/daemon-issue-<n>`, branched from a configured base branch
//! as `daemon/issue-<n>`. All create/remove operations serialize on a
//! single [`shipwright_lock::LockFile`] (30 s timeout, the same
//! primitive the state store uses), so two poll-loop iterations never
//! race on the same worktree directory. A stale workspace left over from
//! a crashed or killed job is force-removed before recreation.
//!
//! Org-wide mode (one daemon watching many repos) replaces the worktree
//! with a shallow clone of the target repo instead, kept between runs
//! rather than torn down per-job.
//!
//! Every git invocation (`git worktree add`, `git worktree remove
//! --force`, `git branch -D`, `git clone --depth 1`) goes through
//! `std::process::Command`, following the same pattern as git-context
//! collection elsewhere in the daemon: capture stdout/stderr, map a
//! non-zero exit to a contextual `anyhow::Error`, and never parse
//! porcelain output beyond the one line needed.
//!
//! # Example
//!
//! ```no_run
//! use shipwright_worktree::WorktreeManager;
//! use std::path::Path;
//!
//! let manager = WorktreeManager::new(Path::new("/repo"), Path::new("/repo/.worktrees"));
//! let worktree = manager.prepare(42, "main").expect("prepare worktree");
//! println!("worktree at {}", worktree.path.display());
//! ```

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shipwright_lock::LockFile;

/// Timeout for the worktree-directory lock.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Directory (relative to the repo root) holding per-job worktrees.
pub const WORKTREES_DIR: &str = ".worktrees";

/// Branch prefix for per-job worktree branches.
pub const BRANCH_PREFIX: &str = "daemon/issue-";

/// A prepared worktree for a single job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    /// Absolute path to the worktree directory.
    pub path: PathBuf,
    /// Branch checked out in the worktree.
    pub branch: String,
    /// Issue/job id this worktree belongs to.
    pub issue_id: u64,
}

/// Manages per-job worktrees under a repository's `.worktrees/` directory.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_root: PathBuf,
    worktrees_root: PathBuf,
}

impl WorktreeManager {
    pub fn new(repo_root: &Path, worktrees_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            worktrees_root: worktrees_root.to_path_buf(),
        }
    }

    /// Default worktrees root for a repo: `<repo_root>/.worktrees`.
    pub fn default_for_repo(repo_root: &Path) -> Self {
        Self::new(repo_root, &repo_root.join(WORKTREES_DIR))
    }

    fn worktree_path(&self, issue_id: u64) -> PathBuf {
        self.worktrees_root
            .join(format!("daemon-issue-{issue_id}"))
    }

    fn branch_name(issue_id: u64) -> String {
        format!("{BRANCH_PREFIX}{issue_id}")
    }

    /// Prepare a worktree for `issue_id`, branched from `base_branch`.
    /// Serializes on the worktrees-root lock; force-removes any stale
    /// worktree left for the same issue before recreating it.
    pub fn prepare(&self, issue_id: u64, base_branch: &str) -> Result<Worktree> {
        std::fs::create_dir_all(&self.worktrees_root)
            .with_context(|| format!("failed to create {}", self.worktrees_root.display()))?;

        let mut lock = LockFile::acquire_bounded(&self.worktrees_root, LOCK_TIMEOUT, Some("worktree-prepare"))
            .context("timed out waiting for worktree directory lock")?;

        let path = self.worktree_path(issue_id);
        let branch = Self::branch_name(issue_id);

        if path.exists() {
            self.remove_worktree_at(&path)?;
        }
        self.delete_branch_if_exists(&branch)?;

        run_git(
            &self.repo_root,
            &[
                "worktree",
                "add",
                "-b",
                &branch,
                path.to_str().context("worktree path is not valid UTF-8")?,
                base_branch,
            ],
        )
        .with_context(|| format!("failed to add worktree for issue #{issue_id}"))?;

        lock.release().ok();

        Ok(Worktree {
            path,
            branch,
            issue_id,
        })
    }

    /// Remove the worktree and, unless `keep_branch` is set (a retry was
    /// scheduled and the branch's in-progress commits should survive),
    /// delete its branch too. Called on reap.
    pub fn teardown(&self, issue_id: u64, keep_branch: bool) -> Result<()> {
        let mut lock = LockFile::acquire_bounded(&self.worktrees_root, LOCK_TIMEOUT, Some("worktree-teardown"))
            .context("timed out waiting for worktree directory lock")?;

        let path = self.worktree_path(issue_id);
        if path.exists() {
            self.remove_worktree_at(&path)?;
        }
        if !keep_branch {
            self.delete_branch_if_exists(&Self::branch_name(issue_id))?;
        }

        lock.release().ok();
        Ok(())
    }

    fn remove_worktree_at(&self, path: &Path) -> Result<()> {
        let path_str = path.to_str().context("worktree path is not valid UTF-8")?;
        let result = run_git(&self.repo_root, &["worktree", "remove", "--force", path_str]);
        if result.is_err() && path.exists() {
            std::fs::remove_dir_all(path)
                .with_context(|| format!("failed to force-remove stale worktree {}", path.display()))?;
            let _ = run_git(&self.repo_root, &["worktree", "prune"]);
        }
        Ok(())
    }

    fn delete_branch_if_exists(&self, branch: &str) -> Result<()> {
        if branch_exists(&self.repo_root, branch)? {
            run_git(&self.repo_root, &["branch", "-D", branch])
                .with_context(|| format!("failed to delete branch {branch}"))?;
        }
        Ok(())
    }
}

fn branch_exists(repo_root: &Path, branch: &str) -> Result<bool> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", "--quiet", branch])
        .current_dir(repo_root)
        .output()
        .context("failed to run git rev-parse")?;
    Ok(output.status.success())
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("failed to run git {args:?}"))?;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Org-wide mode: a shallow clone of `repo_url` kept at `dest` between
/// runs (cloned once, fetched thereafter) rather than torn down per job.
#[derive(Debug, Clone)]
pub struct OrgClone {
    pub path: PathBuf,
}

impl OrgClone {
    /// Ensure a shallow clone of `repo_url` exists at `dest`, cloning if
    /// absent and fetching the latest `base_branch` otherwise.
    pub fn ensure(repo_url: &str, dest: &Path, base_branch: &str) -> Result<Self> {
        if dest.exists() {
            run_git(dest, &["fetch", "--depth", "1", "origin", base_branch])
                .context("failed to refresh org-mode shallow clone")?;
            run_git(dest, &["checkout", base_branch]).context("failed to checkout base branch")?;
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let dest_str = dest.to_str().context("clone dest is not valid UTF-8")?;
            run_git(
                Path::new("."),
                &[
                    "clone",
                    "--depth",
                    "1",
                    "--branch",
                    base_branch,
                    repo_url,
                    dest_str,
                ],
            )
            .context("failed to shallow-clone org repo")?;
        }

        Ok(Self {
            path: dest.to_path_buf(),
        })
    }
}

/// Git context captured for a worktree, used in pipeline/event audit
/// records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitContext {
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub dirty: Option<bool>,
}

impl GitContext {
    pub fn has_commit(&self) -> bool {
        self.commit.is_some()
    }

    pub fn short_commit(&self) -> Option<&str> {
        self.commit.as_ref().map(|c| if c.len() > 7 { &c[..7] } else { c.as_str() })
    }
}

/// Check if the git working tree at `path` is clean (no uncommitted changes).
pub fn is_git_clean(path: &Path) -> Result<bool> {
    let output = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(path)
        .output()
        .context("failed to run git status")?;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "git status failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    Ok(output.stdout.is_empty())
}

/// Get the current commit hash at `path`.
pub fn get_commit_hash(path: &Path) -> Result<String> {
    run_git(path, &["rev-parse", "HEAD"])
}

/// Get the current branch name at `path`, or `None` in detached HEAD.
pub fn get_branch(path: &Path) -> Result<Option<String>> {
    let branch = run_git(path, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    if branch == "HEAD" {
        return Ok(None);
    }
    Ok(Some(branch))
}

/// Capture a [`GitContext`] snapshot, used for audit records when a
/// stage commits or fails mid-worktree.
pub fn get_git_context(path: &Path) -> GitContext {
    GitContext {
        commit: get_commit_hash(path).ok(),
        branch: get_branch(path).ok().flatten(),
        dirty: is_git_clean(path).ok().map(|c| !c),
    }
}
