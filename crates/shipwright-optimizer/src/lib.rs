//! Self-optimization of daemon config from DORA signals.
//!
//! [`optimize`] is pure: it takes the config and the event window the
//! caller has already gathered (the supervisor runs this every
//! `optimize_interval` cycles over the last 7 days of `events.jsonl`)
//! and returns what it did. Config fields it can actually move — the
//! default template, `max_parallel`, `poll_interval`, `auto_template` —
//! are mutated in place and reported as applied changes; everything
//! else is merely a "recommendation" (compound quality, the merge
//! stage, auto-rollback) that has no corresponding config knob yet, so
//! it's reported alongside the applied changes for the
//! `daemon.optimize` event and operator visibility, without touching
//! the config.

use std::time::Duration;

use shipwright_config::DaemonConfig;
use shipwright_duration::DurationSecs;
use shipwright_events::dora::{self, DoraSignals};
use shipwright_types::ShipwrightEvent;

const CFR_FULL_TEMPLATE_THRESHOLD: f64 = 0.40;
const CFR_COMPOUND_QUALITY_THRESHOLD: f64 = 0.20;
const CYCLE_TIME_SCALE_UP_MINUTES: f64 = 240.0;
const CYCLE_TIME_AUTO_TEMPLATE_MINUTES: f64 = 120.0;
const DEPLOY_FREQUENCY_PER_WEEK_FLOOR: f64 = 7.0; // < 1/day
const MTTR_ROLLBACK_MINUTES: f64 = 120.0;
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Everything [`optimize`] changed or recommended this run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizationResult {
    /// Human-readable descriptions, applied changes and recommendations
    /// alike, in the order they were evaluated. This is what gets
    /// reported in the `daemon.optimize` event's `changes` field.
    pub changes: Vec<String>,
    /// Whether `config` was actually mutated and needs to be persisted.
    pub config_changed: bool,
}

/// Apply DORA-driven adjustments to `config` based on `recent_events`
/// (already windowed to the period the caller cares about, typically
/// the last 7 days). Returns what was changed or recommended; the
/// caller is responsible for persisting `config` (via
/// `shipwright_config::save`) when [`OptimizationResult::config_changed`]
/// is true, and for emitting the `daemon.optimize` event.
pub fn optimize(config: &mut DaemonConfig, recent_events: &[ShipwrightEvent]) -> OptimizationResult {
    let signals = dora::compute(recent_events);
    let mut result = OptimizationResult::default();

    escalate_template_on_high_cfr(config, &signals, &mut result);
    recommend_compound_quality_on_elevated_cfr(&signals, &mut result);
    scale_up_on_slow_cycle_time(config, &signals, &mut result);
    enable_auto_template_on_moderate_cycle_time(config, &signals, &mut result);
    recommend_merge_stage_on_low_deploy_frequency(&signals, &mut result);
    recommend_auto_rollback_on_high_mttr(&signals, &mut result);

    result
}

fn escalate_template_on_high_cfr(
    config: &mut DaemonConfig,
    signals: &DoraSignals,
    result: &mut OptimizationResult,
) {
    if signals.change_failure_rate <= CFR_FULL_TEMPLATE_THRESHOLD {
        return;
    }
    if config.pipeline_template == "full" {
        return;
    }
    result.changes.push(format!(
        "change-failure rate {:.0}% exceeds 40%: default template '{}' -> 'full'",
        signals.change_failure_rate * 100.0,
        config.pipeline_template
    ));
    config.pipeline_template = "full".to_string();
    result.config_changed = true;
}

fn recommend_compound_quality_on_elevated_cfr(signals: &DoraSignals, result: &mut OptimizationResult) {
    if signals.change_failure_rate > CFR_COMPOUND_QUALITY_THRESHOLD {
        result.changes.push(format!(
            "change-failure rate {:.0}% exceeds 20%: recommend enabling compound-quality cycles",
            signals.change_failure_rate * 100.0
        ));
    }
}

fn scale_up_on_slow_cycle_time(
    config: &mut DaemonConfig,
    signals: &DoraSignals,
    result: &mut OptimizationResult,
) {
    if signals.cycle_time_p50_minutes <= CYCLE_TIME_SCALE_UP_MINUTES {
        return;
    }
    let current = config.poll_interval.0;
    let halved = current / 2;
    let next = if halved < MIN_POLL_INTERVAL { MIN_POLL_INTERVAL } else { halved };

    config.max_parallel += 1;
    result.changes.push(format!(
        "median cycle time {:.0}min exceeds 4h: max_parallel -> {}",
        signals.cycle_time_p50_minutes, config.max_parallel
    ));

    if next != current {
        result.changes.push(format!(
            "median cycle time {:.0}min exceeds 4h: poll_interval {}s -> {}s",
            signals.cycle_time_p50_minutes,
            current.as_secs(),
            next.as_secs()
        ));
        config.poll_interval = DurationSecs(next);
    }
    result.config_changed = true;
}

fn enable_auto_template_on_moderate_cycle_time(
    config: &mut DaemonConfig,
    signals: &DoraSignals,
    result: &mut OptimizationResult,
) {
    if signals.cycle_time_p50_minutes <= CYCLE_TIME_AUTO_TEMPLATE_MINUTES {
        return;
    }
    if config.auto_template {
        return;
    }
    result.changes.push(format!(
        "median cycle time {:.0}min exceeds 2h: auto_template enabled",
        signals.cycle_time_p50_minutes
    ));
    config.auto_template = true;
    result.config_changed = true;
}

fn recommend_merge_stage_on_low_deploy_frequency(signals: &DoraSignals, result: &mut OptimizationResult) {
    if signals.deploy_frequency_per_week < DEPLOY_FREQUENCY_PER_WEEK_FLOOR {
        result.changes.push(format!(
            "deploy frequency {:.1}/week is below 1/day: recommend adding the merge stage",
            signals.deploy_frequency_per_week
        ));
    }
}

fn recommend_auto_rollback_on_high_mttr(signals: &DoraSignals, result: &mut OptimizationResult) {
    if let Some(mttr) = signals.mttr_minutes {
        if mttr > MTTR_ROLLBACK_MINUTES {
            result.changes.push(format!(
                "MTTR {:.0}min exceeds 2h: recommend enabling auto-rollback",
                mttr
            ));
        }
    }
}
