//! Configuration loading for the Shipwright daemon.
//!
//! The daemon reads a single JSON document, `daemon-config.json`, from
//! the repo's `.claude/` directory (or a path given with `--config`).
//! Every field has a documented default, so a blank `{}` is a valid
//! config; `daemon init` writes out the full default document so an
//! operator can see and edit every knob in one place rather than
//! discover them by trial and error.
//!
//! Bad config never aborts the daemon: [`load`] returns an error the
//! caller can log, but [`load_or_default`] is what `daemon start`
//! actually calls, and it falls back to [`DaemonConfig::default`] with
//! a warning on any parse failure.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shipwright_duration::DurationSecs;
use shipwright_retry::RetryPolicy;

/// Default location of the daemon config relative to a repo root.
pub const CONFIG_FILE: &str = ".claude/daemon-config.json";

pub fn config_path(repo_root: &Path) -> PathBuf {
    repo_root.join(CONFIG_FILE)
}

/// Top-level daemon configuration, documented field by field below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Tracker label the supervisor watches for candidate issues.
    pub watch_label: String,
    /// Base interval between poll cycles; adaptively shrunk/expanded
    /// at runtime between 30s and 120s regardless of this value.
    pub poll_interval: DurationSecs,
    /// Maximum number of concurrently spawned pipelines, not counting
    /// the priority lane.
    pub max_parallel: u32,
    /// Name of the built-in or custom template used when neither
    /// `auto_template` selection nor `template_map` produces a match.
    pub pipeline_template: String,
    /// Skip all `StageGate::Approve` gates; for unattended operation.
    pub skip_gates: bool,
    /// AI model identifier passed through to the stage executor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Branch pipelines fork from and merge back into.
    pub base_branch: String,
    pub on_success: OnSuccessConfig,
    pub on_failure: OnFailureConfig,
    pub notifications: NotificationsConfig,
    pub health: HealthConfig,
    /// Labels that make an issue eligible for the priority lane.
    pub priority_labels: Vec<String>,
    pub alerts: AlertsConfig,
    pub patrol: PatrolConfig,
    /// Let the template selector choose automatically rather
    /// than always falling back to `pipeline_template`.
    pub auto_template: bool,
    /// Regex pattern (matched against issue title/labels) to template
    /// name, checked before the DORA-driven auto-selection rules.
    pub template_map: HashMap<String, String>,
    /// Default max retry attempts for a failed pipeline.
    pub max_retries: u32,
    /// Whether retries escalate retry policy with consecutive failures
    /// of the same class.
    pub retry_escalation: bool,
    /// Max times the supervisor restarts a stuck worker before giving up.
    pub max_restarts: u32,
    /// Overrides language-detected test command (the intake stage).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fast_test_cmd: Option<String>,
    pub self_optimize: bool,
    /// Run the self-optimizer every N poll cycles.
    pub optimize_interval: u32,
    pub priority_lane: PriorityLaneConfig,
    /// `"label"` watches `watch_label` issues; `"org"` watches every
    /// repo in `org`; `"repo"` restricts to `repo_filter`.
    pub watch_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_filter: Option<String>,
    pub auto_scale: AutoScaleConfig,
    pub intelligence: IntelligenceConfig,
    /// Retry policy applied to tracker/API calls, distinct from
    /// pipeline-level `max_retries`.
    pub gh_retry: RetryPolicy,
    pub stale_reaper: StaleReaperConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            watch_label: "daemon/queue".to_string(),
            poll_interval: DurationSecs(Duration::from_secs(60)),
            max_parallel: 3,
            pipeline_template: "standard".to_string(),
            skip_gates: false,
            model: None,
            base_branch: "main".to_string(),
            on_success: OnSuccessConfig::default(),
            on_failure: OnFailureConfig::default(),
            notifications: NotificationsConfig::default(),
            health: HealthConfig::default(),
            priority_labels: Vec::new(),
            alerts: AlertsConfig::default(),
            patrol: PatrolConfig::default(),
            auto_template: true,
            template_map: HashMap::new(),
            max_retries: 3,
            retry_escalation: true,
            max_restarts: 2,
            fast_test_cmd: None,
            self_optimize: true,
            optimize_interval: 20,
            priority_lane: PriorityLaneConfig::default(),
            watch_mode: "label".to_string(),
            org: None,
            repo_filter: None,
            auto_scale: AutoScaleConfig::default(),
            intelligence: IntelligenceConfig::default(),
            gh_retry: RetryPolicy::default(),
            stale_reaper: StaleReaperConfig::default(),
            dashboard_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnSuccessConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_label: Option<String>,
    pub close_issue: bool,
}

impl Default for OnSuccessConfig {
    fn default() -> Self {
        Self {
            remove_label: Some("daemon/queue".to_string()),
            add_label: Some("pipeline/complete".to_string()),
            close_issue: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnFailureConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_label: Option<String>,
    pub comment_log_lines: u32,
}

impl Default for OnFailureConfig {
    fn default() -> Self {
        Self {
            add_label: Some("pipeline/failed".to_string()),
            comment_log_lines: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slack_webhook: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub stale_timeout_s: DurationSecs,
    pub heartbeat_timeout_s: DurationSecs,
    pub checkpoint_enabled: bool,
    /// Use the richer progress-vitals score when available, instead of
    /// falling straight to counter thresholds.
    pub progress_based: bool,
    pub stale_checks_before_warn: u32,
    pub stale_checks_before_kill: u32,
    /// Hard wall-clock kill, disabled (`None`) by default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hard_limit_s: Option<DurationSecs>,
    pub nudge_enabled: bool,
    pub nudge_after_checks: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_timeout_s: DurationSecs(Duration::from_secs(600)),
            heartbeat_timeout_s: DurationSecs(Duration::from_secs(120)),
            checkpoint_enabled: true,
            progress_based: true,
            stale_checks_before_warn: 3,
            stale_checks_before_kill: 6,
            hard_limit_s: None,
            nudge_enabled: true,
            nudge_after_checks: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Consecutive same-class failures before a `daemon.alert` fires.
    pub consecutive_failure_threshold: u32,
    /// Disk usage percentage above which a low-disk alert fires.
    pub disk_space_warn_pct: u8,
    /// Queue depth above which a backlog alert fires.
    pub queue_depth_warn: u32,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            consecutive_failure_threshold: 3,
            disk_space_warn_pct: 90,
            queue_depth_warn: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatrolConfig {
    pub enabled: bool,
    pub interval: DurationSecs,
    pub max_issues: u32,
    pub labels: Vec<String>,
}

impl Default for PatrolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DurationSecs(Duration::from_secs(3600)),
            max_issues: 5,
            labels: vec!["daemon/patrol".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityLaneConfig {
    pub enabled: bool,
    pub labels: Vec<String>,
    pub max: u32,
}

impl Default for PriorityLaneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            labels: vec!["priority/urgent".to_string()],
            max: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScaleConfig {
    pub enabled: bool,
    pub interval: DurationSecs,
    pub max_workers: u32,
    pub min_workers: u32,
    pub worker_mem_gb: f64,
    pub estimated_cost_per_job_usd: f64,
}

impl Default for AutoScaleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: DurationSecs(Duration::from_secs(300)),
            max_workers: 6,
            min_workers: 1,
            worker_mem_gb: 2.0,
            estimated_cost_per_job_usd: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntelligenceConfig {
    pub enabled: bool,
    pub composer_enabled: bool,
    pub optimization_enabled: bool,
    pub prediction_enabled: bool,
    pub adaptive_enabled: bool,
    pub priority_strategy: String,
    pub anomaly_threshold: f64,
}

impl Default for IntelligenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            composer_enabled: true,
            optimization_enabled: true,
            prediction_enabled: true,
            adaptive_enabled: true,
            priority_strategy: "dora_weighted".to_string(),
            anomaly_threshold: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaleReaperConfig {
    pub enabled: bool,
    pub interval: DurationSecs,
    pub age_days: u32,
}

impl Default for StaleReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DurationSecs(Duration::from_secs(21600)),
            age_days: 7,
        }
    }
}

/// Load config from `path`, failing on a malformed document.
pub fn load(path: &Path) -> Result<DaemonConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Load config from `path`, returning [`DaemonConfig::default`] (with a
/// warning printed to stderr) on any read or parse failure, and the
/// bare default when the file does not exist at all. This is what
/// `daemon start` calls: a bad config must never stop the daemon from
/// coming up.
pub fn load_or_default(path: &Path) -> DaemonConfig {
    if !path.exists() {
        return DaemonConfig::default();
    }
    match load(path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("warning: {path:?} is invalid, falling back to defaults: {err:#}");
            DaemonConfig::default()
        }
    }
}

/// Serialize `config` as pretty JSON, the form `daemon init` writes.
pub fn render(config: &DaemonConfig) -> Result<String> {
    serde_json::to_string_pretty(config).context("failed to serialize daemon config")
}

/// Write `config` to `path`, creating parent directories as needed.
pub fn save(path: &Path, config: &DaemonConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, render(config)?)
        .with_context(|| format!("failed to write config file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_round_trip_through_json() {
        let config = DaemonConfig::default();
        let json = render(&config).expect("render");
        let parsed: DaemonConfig = serde_json::from_str(&json).expect("parse");
        assert_eq!(config, parsed);
    }

    #[test]
    fn empty_document_uses_every_default() {
        let parsed: DaemonConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(parsed, DaemonConfig::default());
    }

    #[test]
    fn partial_document_only_overrides_named_fields() {
        let parsed: DaemonConfig =
            serde_json::from_str(r#"{"max_parallel": 8, "base_branch": "trunk"}"#)
                .expect("parse");
        assert_eq!(parsed.max_parallel, 8);
        assert_eq!(parsed.base_branch, "trunk");
        assert_eq!(parsed.watch_label, DaemonConfig::default().watch_label);
    }

    #[test]
    fn load_missing_file_is_an_error_but_load_or_default_is_not() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("daemon-config.json");
        assert!(load(&path).is_err());
        assert_eq!(load_or_default(&path), DaemonConfig::default());
    }

    #[test]
    fn malformed_json_falls_back_to_defaults_via_load_or_default() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("daemon-config.json");
        fs::write(&path, "{ not json").expect("write");
        assert!(load(&path).is_err());
        assert_eq!(load_or_default(&path), DaemonConfig::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(".claude").join("daemon-config.json");
        let mut config = DaemonConfig::default();
        config.max_parallel = 7;
        config.priority_labels.push("priority/urgent".to_string());
        save(&path, &config).expect("save");
        let loaded = load(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn duration_fields_accept_humantime_strings() {
        let parsed: DaemonConfig = serde_json::from_str(r#"{"poll_interval": "90s"}"#)
            .expect("parse");
        assert_eq!(parsed.poll_interval.0, Duration::from_secs(90));
    }

    #[test]
    fn config_path_joins_claude_directory() {
        let root = PathBuf::from("/repo");
        assert_eq!(
            config_path(&root),
            PathBuf::from("/repo/.claude/daemon-config.json")
        );
    }
}
