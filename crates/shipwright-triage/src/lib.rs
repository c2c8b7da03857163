//! Issue triage scoring.
//!
//! Produces an integer 0-100 per issue: higher scores process sooner
//! under the default `quick-wins-first` strategy. [`AiTriageAnalyzer`]
//! is the seam for an external AI-backed scorer (out of scope here,
//! since it talks to a model the daemon doesn't own); [`score`] falls
//! back to the deterministic, label/age/complexity-based scorer when
//! no analyzer is supplied or the analyzer declines to answer.

use chrono::{DateTime, Utc};
use shipwright_environment::{detect_task_type, TaskType};

/// What the triage scorer knows about one issue, gathered by the
/// supervisor's candidate poll before scoring.
#[derive(Debug, Clone)]
pub struct TriageInput {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Has at least one open issue that blocks this one.
    pub has_open_blocker: bool,
    /// Blocks at least one other open issue.
    pub blocks_others: bool,
    pub prior_outcome: Option<PriorOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    Critical,
    High,
    Medium,
    Low,
}

/// Result from an external analyzer: complexity 1-10 (higher = harder),
/// an assessed risk tier, and an estimated probability (0-100) that a
/// pipeline attempt succeeds unattended.
#[derive(Debug, Clone, Copy)]
pub struct AiTriageResult {
    pub complexity: u8,
    pub risk: RiskLevel,
    pub success_probability: u8,
}

/// Seam for a pluggable AI-backed triage analyzer. Returning `None`
/// falls through to the deterministic scorer for that issue.
pub trait AiTriageAnalyzer {
    fn analyze(&self, input: &TriageInput) -> Option<AiTriageResult>;
}

/// Score `input`, preferring `analyzer`'s verdict when one is supplied
/// and answers, otherwise using [`deterministic_score`]. The result is
/// always clamped to `0..=100`.
pub fn score(input: &TriageInput, analyzer: Option<&dyn AiTriageAnalyzer>) -> i32 {
    if let Some(analyzer) = analyzer {
        if let Some(result) = analyzer.analyze(input) {
            return ai_score(result);
        }
    }
    deterministic_score(input)
}

fn ai_score(result: AiTriageResult) -> i32 {
    let base = result.success_probability as i32 - 3 * result.complexity as i32;
    let risk_adjustment = match result.risk {
        RiskLevel::Critical => 15,
        RiskLevel::High => 10,
        RiskLevel::Medium => 0,
        RiskLevel::Low => -5,
    };
    (base + risk_adjustment).clamp(0, 100)
}

/// The deterministic scorer used when no AI analyzer is configured,
/// summing six independent signals and clamping the total.
pub fn deterministic_score(input: &TriageInput) -> i32 {
    let mut score = 0i32;
    score += priority_label_signal(&input.labels);
    score += age_signal(input.created_at);
    score += complexity_signal(&input.body);
    score += dependency_signal(input.has_open_blocker, input.blocks_others);
    score += type_signal(&input.title, &input.labels);
    score += memory_signal(input.prior_outcome);
    score.clamp(0, 100)
}

fn has_any_label(labels: &[String], needles: &[&str]) -> bool {
    labels
        .iter()
        .any(|l| needles.iter().any(|n| l.eq_ignore_ascii_case(n)))
}

fn priority_label_signal(labels: &[String]) -> i32 {
    if has_any_label(labels, &["urgent", "p0"]) {
        30
    } else if has_any_label(labels, &["high", "p1"]) {
        20
    } else if has_any_label(labels, &["normal", "p2"]) {
        10
    } else if has_any_label(labels, &["low", "p3"]) {
        5
    } else {
        0
    }
}

fn age_signal(created_at: DateTime<Utc>) -> i32 {
    let age_days = Utc::now().signed_duration_since(created_at).num_days();
    if age_days > 7 {
        15
    } else if age_days > 3 {
        10
    } else if age_days > 1 {
        5
    } else {
        0
    }
}

/// Fewer file references and a shorter body are treated as simpler
/// (higher score); a file reference is approximated as any token
/// containing both a `.` and a `/`, which catches paths and most
/// backtick-quoted filenames without a full markdown parse.
fn complexity_signal(body: &str) -> i32 {
    let file_refs = body
        .split_whitespace()
        .filter(|tok| tok.contains('.') && tok.contains('/'))
        .count();
    let word_count = body.split_whitespace().count();

    if word_count < 80 && file_refs <= 1 {
        20
    } else if word_count < 400 && file_refs <= 5 {
        10
    } else {
        0
    }
}

fn dependency_signal(has_open_blocker: bool, blocks_others: bool) -> i32 {
    let mut signal = 0;
    if has_open_blocker {
        signal -= 15;
    }
    if blocks_others {
        signal += 15;
    }
    signal
}

fn type_signal(title: &str, labels: &[String]) -> i32 {
    if has_any_label(labels, &["security"]) {
        return 10;
    }
    match detect_task_type(title) {
        TaskType::Security | TaskType::Bug => 10,
        TaskType::Feature => 5,
        _ => 0,
    }
}

fn memory_signal(prior_outcome: Option<PriorOutcome>) -> i32 {
    match prior_outcome {
        Some(PriorOutcome::Success) => 10,
        Some(PriorOutcome::Failure) => -5,
        None => 0,
    }
}

/// Candidate processing order. `QuickWinsFirst` (the default) sorts
/// high scores first; `ComplexFirst` reverses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityStrategy {
    QuickWinsFirst,
    ComplexFirst,
}

/// Sort `(issue_id, score)` candidates in place per `strategy`. Ties
/// keep their relative order (a stable sort), so issues discovered
/// earlier in the same poll cycle still process first.
pub fn sort_candidates(candidates: &mut [(u64, i32)], strategy: PriorityStrategy) {
    match strategy {
        PriorityStrategy::QuickWinsFirst => candidates.sort_by(|a, b| b.1.cmp(&a.1)),
        PriorityStrategy::ComplexFirst => candidates.sort_by(|a, b| a.1.cmp(&b.1)),
    }
}
