//! Turns the current repository's `origin` remote into the tracker
//! base URL and `org/repo` slug `HttpTrackerClient` needs, so operators
//! don't have to spell out `--repo` on every invocation.

use std::path::Path;

use anyhow::{bail, Result};
use shipwright_process::run_command_in_dir;

const DEFAULT_TRACKER_BASE_URL: &str = "https://api.github.com";

/// `git@github.com:org/repo.git` or `https://github.com/org/repo` -> `org/repo`.
pub fn detect_repo_slug(repo_root: &Path) -> Result<String> {
    let result = run_command_in_dir("git", &["remote", "get-url", "origin"], repo_root)?;
    if !result.success {
        bail!("failed to read git remote \"origin\" in {}", repo_root.display());
    }
    parse_remote_slug(result.stdout.trim())
}

fn parse_remote_slug(remote: &str) -> Result<String> {
    let trimmed = remote.trim_end_matches(".git");
    let slug = if let Some(rest) = trimmed.strip_prefix("git@github.com:") {
        rest.to_string()
    } else if let Some(rest) = trimmed.strip_prefix("https://github.com/") {
        rest.to_string()
    } else if let Some(rest) = trimmed.strip_prefix("http://github.com/") {
        rest.to_string()
    } else {
        bail!("unrecognized git remote \"{remote}\"; pass --repo org/name explicitly");
    };
    if slug.splitn(2, '/').count() != 2 {
        bail!("git remote \"{remote}\" did not resolve to an org/repo slug");
    }
    Ok(slug)
}

/// Tracker API base URL: `$SHIPWRIGHT_TRACKER_URL` override, else GitHub's.
pub fn tracker_base_url() -> String {
    std::env::var("SHIPWRIGHT_TRACKER_URL").unwrap_or_else(|_| DEFAULT_TRACKER_BASE_URL.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ssh_remote() {
        assert_eq!(parse_remote_slug("git@github.com:acme/widget.git").unwrap(), "acme/widget");
    }

    #[test]
    fn parses_https_remote() {
        assert_eq!(parse_remote_slug("https://github.com/acme/widget").unwrap(), "acme/widget");
    }

    #[test]
    fn rejects_unrecognized_remote() {
        assert!(parse_remote_slug("https://gitlab.com/acme/widget").is_err());
    }
}
