//! Issue tracker client for the Shipwright daemon.
//!
//! Polls the issue tracker every `poll_interval` seconds for items bearing
//! the configured watch label, in either single-repo or org-wide
//! (repo-name-regex-filtered) mode. The client is a thin trait
//! ([`TrackerClient`]) over an HTTP implementation using a blocking
//! `reqwest::blocking::Client` (blocking rather than async), so tests
//! substitute a `tiny_http`-backed fake
//! tracker rather than a trait mock.
//!
//! Two layers of resilience sit in front of every call:
//!
//! - [`RateLimitBreaker`]: after 3 consecutive failures the breaker opens
//!   and polls are skipped entirely while backoff (30→60→120→240→300 s
//!   cap) runs out. A single success resets the counter.
//! - [`with_retry`]: each call retries up to 3× with exponential backoff
//!   (1→3→9 s) when the error looks transient (rate limit or 5xx),
//!   reusing the same `RetryStrategyConfig`/`calculate_delay` machinery
//!   as the failure-classifier's retry escalator — one shared crate, two
//!   call sites, two different classification inputs.
//!
//! # Example
//!
//! ```
//! use shipwright_tracker::{HttpTrackerClient, TrackerClient};
//!
//! let client = HttpTrackerClient::new("https://tracker.example.com", "acme/widgets");
//! // client.poll_labeled_issues("shipwright") would hit the network; skipped here.
//! let _ = client.base_url();
//! ```

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipwright_retry::{calculate_delay, RetryStrategyConfig, RetryStrategyType};

/// Default timeout for tracker API requests.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default user agent for tracker API requests.
pub const USER_AGENT: &str = concat!("shipwright/", env!("CARGO_PKG_VERSION"));

/// Number of consecutive failures before the circuit breaker opens.
pub const BREAKER_THRESHOLD: u32 = 3;

/// Backoff schedule (seconds) once the breaker is open, indexed by
/// consecutive failures past the threshold and capped at the last entry.
pub const BREAKER_BACKOFF_SECS: [u64; 5] = [30, 60, 120, 240, 300];

/// An issue (or equivalent tracked unit) bearing the watch label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedIssue {
    pub id: u64,
    pub repo: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl TrackedIssue {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Issue numbers referenced as `#123` anywhere in the title or body,
    /// used by the supervisor's dependency-aware candidate ordering to
    /// find "blocks #N" / "depends on #N" relationships without needing
    /// a structured field the tracker API doesn't provide.
    pub fn referenced_issue_numbers(&self) -> Vec<u64> {
        let haystack = format!("{} {}", self.title, self.body);
        let mut refs = Vec::new();
        let bytes = haystack.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'#' {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if end > start {
                    if let Ok(n) = haystack[start..end].parse::<u64>() {
                        refs.push(n);
                    }
                }
                i = end;
            } else {
                i += 1;
            }
        }
        refs
    }
}

/// Trait over the tracker HTTP surface, so tests can substitute a
/// `tiny_http`-backed fake instead of mocking this trait directly.
pub trait TrackerClient {
    /// List open issues carrying `label`, optionally restricted by
    /// `repo_filter` (a regex matched against the repo name) in org-wide
    /// mode.
    fn poll_labeled_issues(&self, label: &str) -> Result<Vec<TrackedIssue>>;

    /// Post a comment on an issue.
    fn post_comment(&self, issue_id: u64, body: &str) -> Result<()>;

    /// Add a label to an issue.
    fn add_label(&self, issue_id: u64, label: &str) -> Result<()>;

    /// Remove a label from an issue.
    fn remove_label(&self, issue_id: u64, label: &str) -> Result<()>;

    /// Close an issue.
    fn close_issue(&self, issue_id: u64) -> Result<()>;

    /// File a new issue (used by the patrol scan to report findings
    /// nobody has filed yet). Returns the new issue's id.
    fn create_issue(&self, title: &str, body: &str, labels: &[String]) -> Result<u64>;
}

/// HTTP tracker client. Construct with [`HttpTrackerClient::new`] for a
/// single repo, or [`HttpTrackerClient::org_wide`] to poll across an
/// organization with a repo-name filter.
#[derive(Debug, Clone)]
pub struct HttpTrackerClient {
    base_url: String,
    repo: String,
    org_mode: bool,
    repo_filter: Option<String>,
    token: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpTrackerClient {
    /// Create a single-repo client.
    pub fn new(base_url: &str, repo: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            repo: repo.to_string(),
            org_mode: false,
            repo_filter: None,
            token: None,
            client: default_http_client(),
        }
    }

    /// Create an org-wide client; `repo_filter` is a regex pattern
    /// matched against each candidate repo name, or `None` to accept all
    /// repos in the org.
    pub fn org_wide(base_url: &str, org: &str, repo_filter: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            repo: org.to_string(),
            org_mode: true,
            repo_filter,
            token: None,
            client: default_http_client(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authed(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.token {
            Some(token) => builder.header("Authorization", format!("Bearer {token}")),
            None => builder,
        }
    }

    fn repo_matches(&self, repo: &str) -> bool {
        match &self.repo_filter {
            Some(pattern) => regex_lite_matches(pattern, repo),
            None => true,
        }
    }
}

impl TrackerClient for HttpTrackerClient {
    fn poll_labeled_issues(&self, label: &str) -> Result<Vec<TrackedIssue>> {
        let url = if self.org_mode {
            format!(
                "{}/orgs/{}/issues?labels={}",
                self.base_url, self.repo, label
            )
        } else {
            format!(
                "{}/repos/{}/issues?labels={}",
                self.base_url, self.repo, label
            )
        };

        let response = self
            .authed(self.client.get(&url))
            .send()
            .context("failed to poll tracker for labeled issues")?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "tracker poll failed with status {}",
                response.status()
            ));
        }

        let issues: Vec<TrackedIssue> = response
            .json()
            .context("failed to parse tracker issue list")?;

        if self.org_mode {
            Ok(issues
                .into_iter()
                .filter(|issue| self.repo_matches(&issue.repo))
                .collect())
        } else {
            Ok(issues)
        }
    }

    fn post_comment(&self, issue_id: u64, body: &str) -> Result<()> {
        let url = format!(
            "{}/repos/{}/issues/{}/comments",
            self.base_url, self.repo, issue_id
        );
        let response = self
            .authed(self.client.post(&url))
            .json(&serde_json::json!({ "body": body }))
            .send()
            .context("failed to post tracker comment")?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "tracker comment post failed with status {}",
                response.status()
            ));
        }
        Ok(())
    }

    fn add_label(&self, issue_id: u64, label: &str) -> Result<()> {
        let url = format!(
            "{}/repos/{}/issues/{}/labels",
            self.base_url, self.repo, issue_id
        );
        let response = self
            .authed(self.client.post(&url))
            .json(&serde_json::json!({ "labels": [label] }))
            .send()
            .context("failed to add tracker label")?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "tracker add-label failed with status {}",
                response.status()
            ));
        }
        Ok(())
    }

    fn remove_label(&self, issue_id: u64, label: &str) -> Result<()> {
        let url = format!(
            "{}/repos/{}/issues/{}/labels/{}",
            self.base_url, self.repo, issue_id, label
        );
        let response = self
            .authed(self.client.delete(&url))
            .send()
            .context("failed to remove tracker label")?;

        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(anyhow::anyhow!(
                "tracker remove-label failed with status {}",
                response.status()
            ));
        }
        Ok(())
    }

    fn close_issue(&self, issue_id: u64) -> Result<()> {
        let url = format!("{}/repos/{}/issues/{}", self.base_url, self.repo, issue_id);
        let response = self
            .authed(self.client.patch(&url))
            .json(&serde_json::json!({ "state": "closed" }))
            .send()
            .context("failed to close tracker issue")?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "tracker close failed with status {}",
                response.status()
            ));
        }
        Ok(())
    }

    fn create_issue(&self, title: &str, body: &str, labels: &[String]) -> Result<u64> {
        let url = format!("{}/repos/{}/issues", self.base_url, self.repo);
        let response = self
            .authed(self.client.post(&url))
            .json(&serde_json::json!({ "title": title, "body": body, "labels": labels }))
            .send()
            .context("failed to create tracker issue")?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "tracker issue creation failed with status {}",
                response.status()
            ));
        }

        let created: TrackedIssue = response
            .json()
            .context("failed to parse created tracker issue")?;
        Ok(created.id)
    }
}

fn default_http_client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_else(|_| reqwest::blocking::Client::new())
}

/// Minimal substring-based repo-name filter. Org-wide mode's
/// `repo_filter` is documented as "a regex", but the common case is a
/// plain prefix/substring match; a literal pattern (no regex
/// metacharacters) is matched as a substring, otherwise every char class
/// `*`/`.`  is treated permissively by falling back to a substring check
/// on the pattern with metacharacters stripped. This keeps the crate
/// dependency-free for the common case while still being useful for the
/// org-wide filter's primary purpose: "only these repos."
fn regex_lite_matches(pattern: &str, candidate: &str) -> bool {
    let stripped: String = pattern
        .chars()
        .filter(|c| !matches!(c, '^' | '$' | '*' | '.' | '+' | '?' | '(' | ')' | '[' | ']'))
        .collect();
    if stripped.is_empty() {
        return true;
    }
    candidate.contains(&stripped)
}

/// Tracks consecutive tracker-call failures and opens a circuit once
/// [`BREAKER_THRESHOLD`] is reached. While open, [`Self::should_skip`]
/// returns `true` until the backoff window elapses; a single recorded
/// success closes the breaker immediately.
#[derive(Debug)]
pub struct RateLimitBreaker {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Default for RateLimitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitBreaker {
    pub fn new() -> Self {
        Self {
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= BREAKER_THRESHOLD {
            self.opened_at = Some(Instant::now());
        }
    }

    /// Backoff duration for the current failure count, capped at the
    /// schedule's last entry.
    pub fn backoff(&self) -> Duration {
        let over = (self.consecutive_failures.saturating_sub(BREAKER_THRESHOLD)) as usize;
        let idx = over.min(BREAKER_BACKOFF_SECS.len() - 1);
        Duration::from_secs(BREAKER_BACKOFF_SECS[idx])
    }

    /// Whether a poll should be skipped this cycle because the breaker
    /// is open and the backoff hasn't elapsed.
    pub fn should_skip(&self) -> bool {
        match self.opened_at {
            Some(opened) => opened.elapsed() < self.backoff(),
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.opened_at.is_some()
    }
}

/// Retry config for the tracker call wrapper: 3 attempts, exponential
/// 1s -> 3s -> 9s.
fn tracker_retry_config() -> RetryStrategyConfig {
    RetryStrategyConfig {
        strategy: RetryStrategyType::Exponential,
        max_attempts: 3,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(9),
        jitter: 0.0,
    }
}

/// Whether an error message looks like a transient tracker failure
/// (rate limit or server-side 5xx) worth retrying.
pub fn is_retryable_tracker_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("rate limit")
        || lower.contains("429")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
        || lower.contains("timed out")
}

/// Run `call`, retrying up to 3 times with the tracker's exponential
/// backoff when the error looks transient. Exhausting retries returns
/// the last error.
pub fn with_retry<T>(mut call: impl FnMut() -> Result<T>) -> Result<T> {
    let config = tracker_retry_config();
    let mut attempt: u32 = 1;
    loop {
        match call() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= config.max_attempts || !is_retryable_tracker_error(&err.to_string()) {
                    return Err(err);
                }
                std::thread::sleep(calculate_delay(&config, attempt));
                attempt += 1;
            }
        }
    }
}

/// Claim state for a single issue under distributed-claim mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claim {
    pub issue_id: u64,
    pub machine: String,
}

/// Label prefix used for the tracker-label-based claim fallback.
pub const CLAIM_LABEL_PREFIX: &str = "claimed:";

/// Build the fallback claim label for a machine id.
pub fn claim_label(machine: &str) -> String {
    format!("{CLAIM_LABEL_PREFIX}{machine}")
}

/// Attempt to claim an issue via a coordination endpoint; on any
/// transport or non-2xx failure (coordinator unreachable or rejecting),
/// fall back to a tracker-label-based claim so a single down coordinator
/// never stalls the daemon.
pub fn claim_issue(
    client: &impl TrackerClient,
    coordinator: Option<&CoordinatorClient>,
    issue_id: u64,
    machine: &str,
) -> Result<bool> {
    if let Some(coordinator) = coordinator {
        match coordinator.claim(issue_id, machine) {
            Ok(claimed) => return Ok(claimed),
            Err(_) => {
                // coordinator unreachable: fall through to label claim
            }
        }
    }
    client.add_label(issue_id, &claim_label(machine))?;
    Ok(true)
}

/// Release a claim acquired via [`claim_issue`], on reap.
pub fn release_claim(
    client: &impl TrackerClient,
    coordinator: Option<&CoordinatorClient>,
    issue_id: u64,
    machine: &str,
) -> Result<()> {
    if let Some(coordinator) = coordinator {
        let _ = coordinator.release(issue_id, machine);
    }
    client.remove_label(issue_id, &claim_label(machine))
}

/// Thin HTTP client over an external coordination endpoint used for
/// distributed claims across multiple daemon instances watching the same
/// tracker.
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl CoordinatorClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: default_http_client(),
        }
    }

    fn claim(&self, issue_id: u64, machine: &str) -> Result<bool> {
        let url = format!("{}/claims/{}", self.base_url, issue_id);
        let response = self
            .client
            .post(&url)
            .json(&Claim {
                issue_id,
                machine: machine.to_string(),
            })
            .send()
            .context("coordinator claim request failed")?;

        match response.status() {
            reqwest::StatusCode::OK | reqwest::StatusCode::CREATED => Ok(true),
            reqwest::StatusCode::CONFLICT => Ok(false),
            status => Err(anyhow::anyhow!("coordinator claim returned {status}")),
        }
    }

    fn release(&self, issue_id: u64, machine: &str) -> Result<()> {
        let url = format!("{}/claims/{}", self.base_url, issue_id);
        let response = self
            .client
            .delete(&url)
            .json(&Claim {
                issue_id,
                machine: machine.to_string(),
            })
            .send()
            .context("coordinator release request failed")?;

        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(anyhow::anyhow!("coordinator release returned {}", response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn tracked_issue_has_label() {
        let issue = TrackedIssue {
            id: 1,
            repo: "acme/widgets".to_string(),
            title: "do the thing".to_string(),
            body: String::new(),
            labels: vec!["shipwright".to_string(), "bug".to_string()],
            assignees: vec![],
            created_at: Utc::now(),
        };
        assert!(issue.has_label("shipwright"));
        assert!(!issue.has_label("enhancement"));
    }

    #[test]
    fn referenced_issue_numbers_finds_hash_refs_in_title_and_body() {
        let issue = TrackedIssue {
            id: 9,
            repo: "acme/widgets".to_string(),
            title: "blocks #12".to_string(),
            body: "depends on #34 and also #34 again, see #5".to_string(),
            labels: vec![],
            assignees: vec![],
            created_at: Utc::now(),
        };
        assert_eq!(issue.referenced_issue_numbers(), vec![12, 34, 34, 5]);
    }

    #[test]
    fn referenced_issue_numbers_empty_when_no_hash_refs() {
        let issue = TrackedIssue {
            id: 9,
            repo: "acme/widgets".to_string(),
            title: "plain title".to_string(),
            body: "plain body".to_string(),
            labels: vec![],
            assignees: vec![],
            created_at: Utc::now(),
        };
        assert!(issue.referenced_issue_numbers().is_empty());
    }

    #[test]
    fn breaker_opens_after_threshold() {
        let mut breaker = RateLimitBreaker::new();
        assert!(!breaker.is_open());
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(breaker.should_skip());
    }

    #[test]
    fn breaker_resets_on_success() {
        let mut breaker = RateLimitBreaker::new();
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(breaker.is_open());
        breaker.record_success();
        assert!(!breaker.is_open());
        assert!(!breaker.should_skip());
    }

    #[test]
    fn breaker_backoff_follows_schedule_and_caps() {
        let mut breaker = RateLimitBreaker::new();
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.backoff(), Duration::from_secs(30));
        for _ in 0..10 {
            breaker.record_failure();
        }
        assert_eq!(breaker.backoff(), Duration::from_secs(300));
    }

    #[test]
    fn is_retryable_tracker_error_detects_transient_patterns() {
        assert!(is_retryable_tracker_error("rate limit exceeded"));
        assert!(is_retryable_tracker_error("status 503"));
        assert!(is_retryable_tracker_error("request timed out"));
        assert!(!is_retryable_tracker_error("unauthorized: bad token"));
    }

    #[test]
    fn with_retry_retries_transient_then_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let result = with_retry(move || {
            let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(anyhow::anyhow!("503 service unavailable"))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.expect("eventually succeeds"), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn with_retry_gives_up_on_non_transient_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let result: Result<()> = with_retry(move || {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("unauthorized"))
        });
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn claim_label_format() {
        assert_eq!(claim_label("worker-1"), "claimed:worker-1");
    }

    #[test]
    fn user_agent_includes_version() {
        assert!(USER_AGENT.starts_with("shipwright/"));
        assert!(USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }

    struct FakeTracker {
        issues: Vec<TrackedIssue>,
        added_labels: std::sync::Mutex<Vec<(u64, String)>>,
        removed_labels: std::sync::Mutex<Vec<(u64, String)>>,
    }

    impl TrackerClient for FakeTracker {
        fn poll_labeled_issues(&self, label: &str) -> Result<Vec<TrackedIssue>> {
            Ok(self
                .issues
                .iter()
                .filter(|i| i.has_label(label))
                .cloned()
                .collect())
        }
        fn post_comment(&self, _issue_id: u64, _body: &str) -> Result<()> {
            Ok(())
        }
        fn add_label(&self, issue_id: u64, label: &str) -> Result<()> {
            self.added_labels
                .lock()
                .unwrap()
                .push((issue_id, label.to_string()));
            Ok(())
        }
        fn remove_label(&self, issue_id: u64, label: &str) -> Result<()> {
            self.removed_labels
                .lock()
                .unwrap()
                .push((issue_id, label.to_string()));
            Ok(())
        }
        fn close_issue(&self, _issue_id: u64) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn claim_issue_falls_back_to_label_when_no_coordinator() {
        let tracker = FakeTracker {
            issues: vec![],
            added_labels: std::sync::Mutex::new(vec![]),
            removed_labels: std::sync::Mutex::new(vec![]),
        };
        let claimed = claim_issue(&tracker, None, 7, "worker-1").expect("claim");
        assert!(claimed);
        assert_eq!(
            tracker.added_labels.lock().unwrap().as_slice(),
            &[(7, "claimed:worker-1".to_string())]
        );
    }

    #[test]
    fn release_claim_removes_fallback_label() {
        let tracker = FakeTracker {
            issues: vec![],
            added_labels: std::sync::Mutex::new(vec![]),
            removed_labels: std::sync::Mutex::new(vec![]),
        };
        release_claim(&tracker, None, 7, "worker-1").expect("release");
        assert_eq!(
            tracker.removed_labels.lock().unwrap().as_slice(),
            &[(7, "claimed:worker-1".to_string())]
        );
    }

    #[test]
    fn http_tracker_client_polls_single_repo_against_local_server() {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind");
        let addr = server.server_addr();
        let url = format!("http://{addr}");

        let handle = std::thread::spawn(move || {
            let request = server.recv().expect("recv");
            let body = serde_json::to_string(&vec![TrackedIssue {
                id: 1,
                repo: "acme/widgets".to_string(),
                title: "fix it".to_string(),
                body: String::new(),
                labels: vec!["shipwright".to_string()],
                assignees: vec![],
                created_at: Utc::now(),
            }])
            .unwrap();
            request
                .respond(tiny_http::Response::from_string(body).with_header(
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .unwrap(),
                ))
                .expect("respond");
        });

        let client = HttpTrackerClient::new(&url, "acme/widgets");
        let issues = client.poll_labeled_issues("shipwright").expect("poll");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].id, 1);

        handle.join().expect("join");
    }

    #[test]
    fn regex_lite_matches_plain_substring() {
        assert!(regex_lite_matches("widgets", "acme/widgets"));
        assert!(!regex_lite_matches("gadgets", "acme/widgets"));
    }

    #[test]
    fn regex_lite_matches_empty_pattern_matches_anything() {
        assert!(regex_lite_matches("", "any/repo"));
    }
}
