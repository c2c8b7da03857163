//! # Types
//!
//! Core domain types for the Shipwright daemon: the lifecycle of a tracked
//! work item ([`Job`]), its place in the spawn queue ([`QueueEntry`]), the
//! signals the progress sensor watches ([`ProgressSnapshot`]), per-stage
//! bookkeeping ([`StageRecord`], [`PipelineState`]), retry/failure history
//! ([`RetryRecord`], [`FailureHistoryEntry`]), learned metrics
//! ([`Baseline`], [`MemoryEntry`]), the structured event stream
//! ([`ShipwrightEvent`], [`EventType`]), and pipeline templates
//! ([`Template`], [`StageSpec`]).
//!
//! ## Serialization
//!
//! Every persisted struct derives `Serialize`/`Deserialize`/`Debug`/`Clone`.
//! Standalone documents (daemon state, pipeline state, tuning files,
//! baseline files) carry an explicit `version` field so a future format
//! change has somewhere to branch a migration — see [`SCHEMA_VERSION`].
//! Timestamps are `chrono::DateTime<Utc>`.
//!
//! ## Stability
//!
//! These types are considered stable unless otherwise noted. Breaking
//! changes bump [`SCHEMA_VERSION`].

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use shipwright_retry::FailureClass;

/// Schema version stamped at the top of every standalone persisted document
/// (daemon state, pipeline state, tuning file, baselines file,
/// template-weights file).
pub const SCHEMA_VERSION: u32 = 1;

/// A tracked work item's identity: the issue it came from and the epoch
/// second its worker was spawned. Two spawns of the same issue (e.g. a
/// retry) get distinct identities even though `issue_id` repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId {
    pub issue_id: u64,
    pub start_epoch: i64,
}

impl JobId {
    pub fn new(issue_id: u64, start_epoch: i64) -> Self {
        Self {
            issue_id,
            start_epoch,
        }
    }
}

/// The lifecycle of a single tracked work item, from spawn to reap.
///
/// Invariants the state store enforces:
/// - at most one non-terminal `Job` per `issue_id` at a time;
/// - `pid` is unique among currently-active jobs;
/// - the workspace at `workspace_path` is owned exclusively by this `Job`
///   for its lifetime (see the worktree manager).
///
/// A `Job` starts `Active`, is `Reaped` when its process exits, and then
/// either gets a new `Job` scheduled as a retry (incrementing
/// `retry_count`) or becomes terminal. Terminal jobs move to the daemon
/// state's capped `completed` list (last 500), pruning the oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub issue_id: u64,
    pub title: String,
    /// Title plus a body extract, handed to the pipeline as its goal.
    pub goal: String,
    pub pid: u32,
    pub workspace_path: PathBuf,
    pub template: String,
    pub started_at: DateTime<Utc>,
    pub repo: String,
    pub retry_count: u32,
    pub status: JobStatus,
}

/// Where a [`Job`] sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Active,
    Reaped { success: bool },
}

/// An issue waiting for a free worker slot.
///
/// Ordered by `triage_score` descending at enqueue time (or ascending under
/// the `complex-first` strategy — the ordering itself lives with the
/// supervisor, this struct just carries the sort key). `issue_id` is
/// deduplicated: enqueuing an issue already queued is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub issue_id: u64,
    pub triage_score: i32,
    pub enqueued_at: DateTime<Utc>,
}

/// One observation of a [`Job`]'s activity, taken once per poll cycle by
/// the progress sensor. Kept as a bounded ring of the last 10 per
/// issue so trend comparisons ("did the diff grow since last time") don't
/// need the whole history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub stage: String,
    pub iteration: u32,
    pub diff_lines: u64,
    pub files_changed: u32,
    pub last_error_signature: Option<String>,
    pub ts: DateTime<Utc>,
}

/// Per-issue progress bookkeeping the supervisor keeps between polls.
///
/// `no_progress_count` increments when a new snapshot shows no advance
/// (same stage, same iteration, diff/file counts unchanged, and the
/// worker's process tree isn't burning CPU) relative to the previous
/// snapshot, and resets to 0 the moment any of those signals move.
/// `repeated_error_count` increments when `last_error_signature` is
/// unchanged from the prior snapshot and resets when it changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressHistory {
    pub snapshots: Vec<ProgressSnapshot>,
    pub no_progress_count: u32,
    pub repeated_error_count: u32,
}

impl ProgressHistory {
    pub const RING_CAPACITY: usize = 10;

    /// Push a new snapshot, evicting the oldest once the ring is full.
    pub fn push(&mut self, snapshot: ProgressSnapshot) {
        if self.snapshots.len() >= Self::RING_CAPACITY {
            self.snapshots.remove(0);
        }
        self.snapshots.push(snapshot);
    }

    pub fn latest(&self) -> Option<&ProgressSnapshot> {
        self.snapshots.last()
    }
}

/// The sensor's assessment of a `Job`'s health, mapped from
/// `no_progress_count`/`repeated_error_count` (or a richer externally
/// supplied "vitals" score).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressVerdict {
    Healthy,
    Slowing,
    Stalled,
    Stuck,
}

/// Status of a single stage within a [`PipelineState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Retrying,
    Skipped,
}

/// Per-stage status and timing, ordered by the stage's position in its
/// template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage_id: String,
    pub status: StageStatus,
    pub start_epoch: Option<i64>,
    pub end_epoch: Option<i64>,
}

impl StageRecord {
    pub fn pending(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            status: StageStatus::Pending,
            start_epoch: None,
            end_epoch: None,
        }
    }
}

/// The outcome of running one stage, as produced by the stage executor and
/// consumed by the classifier. Tagged so the executor can distinguish a
/// clean pass from a retried-then-passed stage without losing the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    Retried { reason: String },
    Failed { class: FailureClass },
}

/// Pipeline state scoped to one `Job`'s workspace: goal, template, branch,
/// current stage, the ordered [`StageRecord`] list, and a log trail.
/// Persisted to the workspace so an interrupted pipeline (daemon restart,
/// worker crash) can resume from `current_stage` rather than rerunning
/// everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub version: u32,
    pub issue_id: u64,
    pub goal: String,
    pub template: String,
    pub branch: String,
    pub current_stage: String,
    pub stages: Vec<StageRecord>,
    pub log_trail: Vec<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub self_heal_count: u32,
}

impl PipelineState {
    pub fn new(issue_id: u64, goal: impl Into<String>, template: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            version: SCHEMA_VERSION,
            issue_id,
            goal: goal.into(),
            template: template.into(),
            branch: branch.into(),
            current_stage: String::new(),
            stages: Vec::new(),
            log_trail: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            self_heal_count: 0,
        }
    }

    pub fn stage_mut(&mut self, stage_id: &str) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|s| s.stage_id == stage_id)
    }
}

/// Per-issue retry bookkeeping: how many attempts have been made, the most
/// recent failure's class, and the per-class ceiling that applies. Cleared
/// entirely on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    pub issue_id: u64,
    pub attempt_count: u32,
    pub last_failure_class: Option<FailureClass>,
    pub max_retries_for_class: u32,
}

/// One entry in the daemon-wide failure history tail (capped at the last
/// 100), used to detect runs of consecutive same-class failures that
/// should trip the daemon-wide backoff pause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureHistoryEntry {
    pub ts: DateTime<Utc>,
    pub class: FailureClass,
}

/// A learned metric for `(stage, metric_name)`, updated by an exponential
/// moving average: `new = 0.9 * old + 0.1 * current`. EMA update is
/// idempotent in the sense that applying the same sample twice produces
/// the same result as applying the average of the two applied once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub stage: String,
    pub metric_name: String,
    pub value: f64,
    pub count: u64,
    pub updated_at: DateTime<Utc>,
}

impl Baseline {
    pub fn new(stage: impl Into<String>, metric_name: impl Into<String>, initial: f64) -> Self {
        let now = Utc::now();
        Self {
            stage: stage.into(),
            metric_name: metric_name.into(),
            value: initial,
            count: 1,
            updated_at: now,
        }
    }

    /// Fold a new observation into the baseline via EMA, in place.
    pub fn observe(&mut self, current: f64) {
        self.value = 0.9 * self.value + 0.1 * current;
        self.count += 1;
        self.updated_at = Utc::now();
    }

    /// Classify `current` against this baseline: `> 3x` is `critical`,
    /// `> 2x` is `warning`, else `normal`.
    pub fn anomaly_severity(&self, current: f64) -> AnomalySeverity {
        if self.value <= 0.0 {
            return AnomalySeverity::Normal;
        }
        let ratio = current / self.value;
        if ratio > 3.0 {
            AnomalySeverity::Critical
        } else if ratio > 2.0 {
            AnomalySeverity::Warning
        } else {
            AnomalySeverity::Normal
        }
    }
}

/// Severity bucket produced by [`Baseline::anomaly_severity`]. Events are
/// only emitted for non-`Normal` severities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Normal,
    Warning,
    Critical,
}

/// A recorded failure pattern, consumed by the triage scorer and injected
/// as preventative context into new pipelines that touch the same code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub signature: String,
    pub stage: String,
    pub seen_count: u32,
    pub last_seen: DateTime<Utc>,
    pub root_cause: Option<String>,
}

/// A flag and retry budget attached to one stage in a [`Template`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub stage_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub gate: StageGate,
    #[serde(default)]
    pub retries: u32,
}

fn default_true() -> bool {
    true
}

/// Whether a stage requires manual approval before the pipeline proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageGate {
    #[default]
    None,
    Approve,
}

/// A named, ordered list of stages plus shared knobs (e.g.
/// `build_test_retries`, `max_cycles` for compound quality). Built-in
/// templates (`fast`, `standard`, `full`, `hotfix`, `enterprise`) are
/// bundled as static values; operators may add more via config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub build_test_retries: u32,
    #[serde(default)]
    pub max_cycles: u32,
    #[serde(default)]
    pub coverage_min: Option<f64>,
}

pub const STAGE_ORDER: &[&str] = &[
    "intake",
    "plan",
    "design",
    "build",
    "test",
    "review",
    "compound_quality",
    "pr",
    "merge",
    "deploy",
    "validate",
    "monitor",
];

impl Template {
    /// The five built-in templates, in ascending order of
    /// rigor/cost except `hotfix`, which trims everything but the
    /// essentials for a fast turnaround.
    pub fn fast() -> Self {
        Self::from_stage_ids(
            "fast",
            &["intake", "build", "test", "pr", "merge"],
            1,
            1,
        )
    }

    pub fn standard() -> Self {
        Self::from_stage_ids(
            "standard",
            &[
                "intake", "plan", "build", "test", "review", "pr", "merge", "deploy",
            ],
            2,
            1,
        )
    }

    pub fn full() -> Self {
        Self::from_stage_ids("full", STAGE_ORDER, 3, 3)
    }

    pub fn hotfix() -> Self {
        Self::from_stage_ids(
            "hotfix",
            &["intake", "build", "test", "pr", "merge", "deploy", "validate"],
            1,
            1,
        )
    }

    pub fn enterprise() -> Self {
        let mut t = Self::from_stage_ids("enterprise", STAGE_ORDER, 3, 5);
        if let Some(review) = t.stages.iter_mut().find(|s| s.stage_id == "review") {
            review.gate = StageGate::Approve;
        }
        if let Some(merge) = t.stages.iter_mut().find(|s| s.stage_id == "merge") {
            merge.gate = StageGate::Approve;
        }
        t
    }

    fn from_stage_ids(
        name: &str,
        stage_ids: &[&str],
        build_test_retries: u32,
        max_cycles: u32,
    ) -> Self {
        Self {
            name: name.to_string(),
            stages: stage_ids
                .iter()
                .map(|id| StageSpec {
                    stage_id: id.to_string(),
                    enabled: true,
                    gate: StageGate::None,
                    retries: 1,
                })
                .collect(),
            build_test_retries,
            max_cycles,
            coverage_min: None,
        }
    }

    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "fast" => Some(Self::fast()),
            "standard" => Some(Self::standard()),
            "full" => Some(Self::full()),
            "hotfix" => Some(Self::hotfix()),
            "enterprise" => Some(Self::enterprise()),
            _ => None,
        }
    }
}

/// A single record in the append-only, size-rotated event log.
/// Every write carries both a human timestamp and its epoch-seconds
/// twin so log readers can sort without re-parsing RFC3339.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipwrightEvent {
    pub ts: DateTime<Utc>,
    pub ts_epoch: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<u64>,
    #[serde(flatten)]
    pub event_type: EventType,
}

impl ShipwrightEvent {
    pub fn new(event_type: EventType, issue_id: Option<u64>) -> Self {
        let now = Utc::now();
        Self {
            ts: now,
            ts_epoch: now.timestamp(),
            issue_id,
            event_type,
        }
    }
}

/// Event schema (selected types): each variant's `type` tag matches
/// the dotted name operators grep for in `events.jsonl`
/// (`pipeline.started`, `daemon.retry_exhausted`, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventType {
    #[serde(rename = "pipeline.started")]
    PipelineStarted { template: String },
    #[serde(rename = "pipeline.completed")]
    PipelineCompleted {
        result: PipelineResult,
        duration_s: f64,
        input_tokens: u64,
        output_tokens: u64,
        self_heal_count: u32,
    },
    #[serde(rename = "stage.started")]
    StageStarted { stage: String },
    #[serde(rename = "stage.completed")]
    StageCompleted { stage: String, duration_s: f64 },
    #[serde(rename = "stage.failed")]
    StageFailed { stage: String, class: FailureClass },

    #[serde(rename = "daemon.spawn")]
    DaemonSpawn { pid: u32, template: String },
    #[serde(rename = "daemon.reap")]
    DaemonReap { pid: u32, success: bool },
    #[serde(rename = "daemon.retry")]
    DaemonRetry { attempt: u32, class: FailureClass },
    #[serde(rename = "daemon.retry_exhausted")]
    DaemonRetryExhausted { class: FailureClass },
    #[serde(rename = "daemon.scale")]
    DaemonScale {
        max_parallel: u32,
        cpu_cap: u32,
        memory_cap: u32,
        budget_cap: u32,
        queue_cap: u32,
    },
    #[serde(rename = "daemon.alert")]
    DaemonAlert { message: String },
    #[serde(rename = "daemon.auto_pause")]
    DaemonAutoPause { reason: String, resume_after: DateTime<Utc> },
    #[serde(rename = "daemon.rate_limit")]
    DaemonRateLimit { backoff_s: u64 },
    #[serde(rename = "daemon.optimize")]
    DaemonOptimize { changes: Vec<String> },

    #[serde(rename = "patrol.finding")]
    PatrolFinding { signal: String, detail: String },
    #[serde(rename = "patrol.issue_created")]
    PatrolIssueCreated { issue_id: u64 },

    #[serde(rename = "prediction.risk_assessed")]
    PredictionRiskAssessed { risk: u8 },
    #[serde(rename = "prediction.anomaly")]
    PredictionAnomaly {
        metric: String,
        severity: AnomalySeverity,
    },

    #[serde(rename = "monitor.check")]
    MonitorCheck { healthy: bool },
    #[serde(rename = "monitor.alert")]
    MonitorAlert { error_count: u32 },
    #[serde(rename = "monitor.rollback")]
    MonitorRollback { reason: String },
    #[serde(rename = "monitor.rollback_verified")]
    MonitorRollbackVerified { verified: bool },
}

/// Overall outcome of a completed pipeline, carried on `pipeline.completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineResult {
    Success,
    Failure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_history_ring_evicts_oldest() {
        let mut history = ProgressHistory::default();
        for i in 0..15u32 {
            history.push(ProgressSnapshot {
                stage: "build".to_string(),
                iteration: i,
                diff_lines: 0,
                files_changed: 0,
                last_error_signature: None,
                ts: Utc::now(),
            });
        }
        assert_eq!(history.snapshots.len(), ProgressHistory::RING_CAPACITY);
        assert_eq!(history.latest().unwrap().iteration, 14);
        assert_eq!(history.snapshots.first().unwrap().iteration, 5);
    }

    #[test]
    fn baseline_ema_converges_toward_repeated_samples() {
        let mut baseline = Baseline::new("build", "duration_s", 100.0);
        for _ in 0..50 {
            baseline.observe(200.0);
        }
        assert!((baseline.value - 200.0).abs() < 1.0);
    }

    #[test]
    fn baseline_ema_is_idempotent_under_averaging() {
        let mut a = Baseline::new("test", "duration_s", 100.0);
        a.observe(110.0);
        a.observe(130.0);

        let mut b = Baseline::new("test", "duration_s", 100.0);
        b.observe((110.0 + 130.0) / 2.0);

        assert!((a.value - b.value).abs() < 1e-9);
    }

    #[test]
    fn anomaly_severity_thresholds() {
        let baseline = Baseline::new("build", "duration_s", 100.0);
        assert_eq!(baseline.anomaly_severity(150.0), AnomalySeverity::Normal);
        assert_eq!(baseline.anomaly_severity(250.0), AnomalySeverity::Warning);
        assert_eq!(baseline.anomaly_severity(350.0), AnomalySeverity::Critical);
    }

    #[test]
    fn builtin_templates_are_all_resolvable() {
        for name in ["fast", "standard", "full", "hotfix", "enterprise"] {
            let template = Template::builtin(name).expect("builtin template");
            assert_eq!(template.name, name);
            assert!(!template.stages.is_empty());
        }
        assert!(Template::builtin("nonexistent").is_none());
    }

    #[test]
    fn enterprise_template_gates_review_and_merge() {
        let template = Template::enterprise();
        let review = template.stages.iter().find(|s| s.stage_id == "review").unwrap();
        let merge = template.stages.iter().find(|s| s.stage_id == "merge").unwrap();
        assert_eq!(review.gate, StageGate::Approve);
        assert_eq!(merge.gate, StageGate::Approve);
    }

    #[test]
    fn event_serializes_with_dotted_type_tag() {
        let event = ShipwrightEvent::new(
            EventType::PipelineStarted {
                template: "fast".to_string(),
            },
            Some(42),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"pipeline.started\""));
        assert!(json.contains("\"issue_id\":42"));

        let parsed: ShipwrightEvent = serde_json::from_str(&json).unwrap();
        match parsed.event_type {
            EventType::PipelineStarted { template } => assert_eq!(template, "fast"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn pipeline_state_tracks_stage_by_id() {
        let mut state = PipelineState::new(7, "fix the bug", "fast", "daemon/issue-7");
        state.stages.push(StageRecord::pending("build"));
        state.stage_mut("build").unwrap().status = StageStatus::Running;
        assert_eq!(state.stage_mut("build").unwrap().status, StageStatus::Running);
        assert!(state.stage_mut("deploy").is_none());
    }

    #[test]
    fn job_status_roundtrips_through_json() {
        let status = JobStatus::Reaped { success: true };
        let json = serde_json::to_string(&status).unwrap();
        let parsed: JobStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
    }

    proptest::proptest! {
        #[test]
        fn baseline_ema_stays_between_old_and_new(old in 1.0f64..1000.0, current in 1.0f64..1000.0) {
            let mut baseline = Baseline::new("x", "y", old);
            baseline.observe(current);
            let lo = old.min(current);
            let hi = old.max(current);
            proptest::prop_assert!(baseline.value >= lo - 1e-9 && baseline.value <= hi + 1e-9);
        }
    }
}
