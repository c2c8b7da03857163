//! Pipeline template selection.
//!
//! [`select`] evaluates the precedence chain in strict order and stops
//! at the first rule that produces an answer; the score-based default
//! (step 8) always produces one, so the function is total. Each rule is
//! its own function so the chain reads as a list rather than one long
//! `if`/`else` ladder, and so each step is independently testable.

use std::collections::HashMap;

use regex::Regex;
use shipwright_events::dora::{self, DoraSignals};
use shipwright_types::{ShipwrightEvent, Template};

/// Everything [`select`] needs, gathered by the supervisor before
/// choosing a template for one issue.
#[derive(Debug, Clone, Default)]
pub struct TemplateSelectionInput {
    pub labels: Vec<String>,
    pub triage_score: i32,
    /// An AI-composed template spec, already validated by the caller.
    pub ai_composed: Option<Template>,
    /// Last `N` (typically 5) `pipeline.completed` events, most recent last.
    pub recent_completions: Vec<ShipwrightEvent>,
    pub branch_protection_strict: bool,
    /// Regex pattern (matched against the joined label/title text) to
    /// template name, from `template_map` config, checked in insertion
    /// order... callers should pass an ordered `Vec` instead of a
    /// `HashMap` when pattern order matters; ties are resolved by
    /// first match here.
    pub template_map: Vec<(String, String)>,
    /// Text (title + body) the `template_map` regexes match against.
    pub match_text: String,
    pub quality_memory: Option<QualityMemorySignal>,
    /// Learned template -> (successes, attempts), from the
    /// `template-weights.json` optimization file.
    pub template_weights: HashMap<String, (u32, u32)>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QualityMemorySignal {
    pub recent_critical_findings: bool,
    pub avg_quality: f64,
}

/// Select a template for one issue by walking the precedence chain in
/// precedence order, resolving each candidate template name against the
/// built-in set via [`Template::builtin`]. A name with no built-in
/// match falls through to the next rule rather than erroring, since an
/// operator-defined template name in `template_map` is expected to be
/// resolved by the caller against their own custom template set first.
pub fn select(input: &TemplateSelectionInput) -> Template {
    if let Some(ai) = ai_composed(input) {
        return ai;
    }
    if let Some(name) = dora_escalation(input) {
        if let Some(t) = Template::builtin(name) {
            return t;
        }
    }
    if input.branch_protection_strict {
        return Template::enterprise();
    }
    if let Some(name) = label_override(input) {
        if let Some(t) = Template::builtin(name) {
            return t;
        }
    }
    if let Some(name) = config_label_map(input) {
        if let Some(t) = Template::builtin(&name) {
            return t;
        }
    }
    if let Some(name) = quality_memory_override(input) {
        if let Some(t) = Template::builtin(name) {
            return t;
        }
    }
    if let Some(name) = learned_weights(input) {
        if let Some(t) = Template::builtin(&name) {
            return t;
        }
    }
    score_default(input.triage_score)
}

fn ai_composed(input: &TemplateSelectionInput) -> Option<Template> {
    input.ai_composed.clone()
}

/// Step 2: DORA-driven escalation over `recent_completions`. Each
/// condition is independent; the first that fires wins, checked in the
/// order below (change-failure-rate, then cycle time,
/// then deploy frequency).
fn dora_escalation(input: &TemplateSelectionInput) -> Option<&'static str> {
    if input.recent_completions.is_empty() {
        return None;
    }
    let signals: DoraSignals = dora::compute(&input.recent_completions);
    if signals.change_failure_rate > 0.40 {
        return Some("enterprise");
    }
    if signals.cycle_time_p50_minutes > 120.0 {
        return Some("fast");
    }
    if signals.deploy_frequency_per_week < 1.0 {
        return Some("standard");
    }
    None
}

fn has_label(labels: &[String], needle: &str) -> bool {
    labels.iter().any(|l| l.eq_ignore_ascii_case(needle))
}

fn label_override(input: &TemplateSelectionInput) -> Option<&'static str> {
    if has_label(&input.labels, "hotfix") || has_label(&input.labels, "incident") {
        return Some("hotfix");
    }
    if has_label(&input.labels, "security") {
        return Some("enterprise");
    }
    None
}

fn config_label_map(input: &TemplateSelectionInput) -> Option<String> {
    for (pattern, template_name) in &input.template_map {
        if let Ok(re) = Regex::new(pattern) {
            if re.is_match(&input.match_text) {
                return Some(template_name.clone());
            }
        }
    }
    None
}

fn quality_memory_override(input: &TemplateSelectionInput) -> Option<&'static str> {
    let signal = input.quality_memory?;
    if signal.recent_critical_findings {
        return Some("enterprise");
    }
    if signal.avg_quality < 60.0 {
        return Some("full");
    }
    if signal.avg_quality > 80.0 && input.triage_score >= 60 {
        return Some("fast");
    }
    None
}

/// Step 7: pick the template with the highest observed success rate,
/// requiring at least 3 samples so an early lucky/unlucky streak
/// doesn't dominate the choice.
fn learned_weights(input: &TemplateSelectionInput) -> Option<String> {
    input
        .template_weights
        .iter()
        .filter(|(_, (_, total))| *total >= 3)
        .max_by(|(_, (sa, ta)), (_, (sb, tb))| {
            let rate_a = *sa as f64 / *ta as f64;
            let rate_b = *sb as f64 / *tb as f64;
            rate_a.total_cmp(&rate_b)
        })
        .map(|(name, _)| name.clone())
}

fn score_default(triage_score: i32) -> Template {
    if triage_score >= 70 {
        Template::fast()
    } else if triage_score >= 40 {
        Template::standard()
    } else {
        Template::full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_types::{EventType, PipelineResult};

    fn completion(result: PipelineResult, duration_s: f64, ts_epoch: i64) -> ShipwrightEvent {
        ShipwrightEvent {
            ts: chrono::DateTime::from_timestamp(ts_epoch, 0).expect("valid"),
            ts_epoch,
            issue_id: Some(1),
            event_type: EventType::PipelineCompleted {
                result,
                duration_s,
                input_tokens: 0,
                output_tokens: 0,
                self_heal_count: 0,
            },
        }
    }

    #[test]
    fn ai_composed_wins_over_everything() {
        let mut input = TemplateSelectionInput::default();
        input.ai_composed = Some(Template::hotfix());
        input.labels = vec!["security".to_string()];
        let selected = select(&input);
        assert_eq!(selected.name, "hotfix");
    }

    #[test]
    fn high_change_failure_rate_escalates_to_enterprise() {
        let mut input = TemplateSelectionInput::default();
        input.recent_completions = vec![
            completion(PipelineResult::Failure, 60.0, 0),
            completion(PipelineResult::Failure, 60.0, 100),
            completion(PipelineResult::Failure, 60.0, 200),
            completion(PipelineResult::Success, 60.0, 300),
            completion(PipelineResult::Success, 60.0, 400),
        ];
        let selected = select(&input);
        assert_eq!(selected.name, "enterprise");
    }

    #[test]
    fn branch_protection_strictness_forces_enterprise() {
        let mut input = TemplateSelectionInput::default();
        input.branch_protection_strict = true;
        input.triage_score = 90;
        let selected = select(&input);
        assert_eq!(selected.name, "enterprise");
    }

    #[test]
    fn hotfix_label_wins_over_score_default() {
        let mut input = TemplateSelectionInput::default();
        input.labels = vec!["hotfix".to_string()];
        input.triage_score = 10;
        let selected = select(&input);
        assert_eq!(selected.name, "hotfix");
    }

    #[test]
    fn security_label_selects_enterprise() {
        let mut input = TemplateSelectionInput::default();
        input.labels = vec!["security".to_string()];
        let selected = select(&input);
        assert_eq!(selected.name, "enterprise");
    }

    #[test]
    fn config_label_map_matches_before_quality_memory() {
        let mut input = TemplateSelectionInput::default();
        input.template_map = vec![("(?i)docs".to_string(), "fast".to_string())];
        input.match_text = "Update docs for onboarding".to_string();
        input.quality_memory = Some(QualityMemorySignal {
            recent_critical_findings: true,
            avg_quality: 10.0,
        });
        let selected = select(&input);
        assert_eq!(selected.name, "fast");
    }

    #[test]
    fn quality_memory_critical_findings_selects_enterprise() {
        let mut input = TemplateSelectionInput::default();
        input.quality_memory = Some(QualityMemorySignal {
            recent_critical_findings: true,
            avg_quality: 95.0,
        });
        let selected = select(&input);
        assert_eq!(selected.name, "enterprise");
    }

    #[test]
    fn learned_weights_need_at_least_three_samples() {
        let mut input = TemplateSelectionInput::default();
        input.triage_score = 50; // would default to standard
        input.template_weights.insert("fast".to_string(), (1, 2)); // too few samples
        let selected = select(&input);
        assert_eq!(selected.name, "standard");
    }

    #[test]
    fn learned_weights_pick_highest_success_rate() {
        let mut input = TemplateSelectionInput::default();
        input.triage_score = 50;
        input.template_weights.insert("fast".to_string(), (2, 5)); // 0.4
        input.template_weights.insert("full".to_string(), (4, 5)); // 0.8
        let selected = select(&input);
        assert_eq!(selected.name, "full");
    }

    #[test]
    fn score_default_thresholds() {
        assert_eq!(score_default(80).name, "fast");
        assert_eq!(score_default(50).name, "standard");
        assert_eq!(score_default(10).name, "full");
    }
}
