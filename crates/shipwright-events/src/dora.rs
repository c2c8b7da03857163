//! DORA four-keys computation shared by the template selector
//! and the self-optimizer, both of which need the same signal
//! over the same `events.jsonl` window and would otherwise duplicate
//! it.

use shipwright_types::{EventType, PipelineResult, ShipwrightEvent};

/// Deploy frequency, cycle time, change-failure-rate, and MTTR over a
/// window of [`ShipwrightEvent`]s, computed from `pipeline.completed`
/// records only (a pipeline that never reaches `deploy` still counts
/// as a completion for cycle time/change-failure purposes).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DoraSignals {
    /// Completed pipelines per 7-day period covered by the window.
    pub deploy_frequency_per_week: f64,
    /// Median `duration_s` across completions, in minutes.
    pub cycle_time_p50_minutes: f64,
    /// Fraction (0.0-1.0) of completions that failed.
    pub change_failure_rate: f64,
    /// Mean time between a failure and the next success, in minutes.
    /// `None` when there's no failure-then-success pair in the window.
    pub mttr_minutes: Option<f64>,
}

impl DoraSignals {
    pub const EMPTY: DoraSignals = DoraSignals {
        deploy_frequency_per_week: 0.0,
        cycle_time_p50_minutes: 0.0,
        change_failure_rate: 0.0,
        mttr_minutes: None,
    };
}

/// Compute [`DoraSignals`] over `events`, which should already be
/// filtered to the window the caller cares about (e.g. "last 5
/// completions", or "last 30 days" for the self-optimizer).
pub fn compute(events: &[ShipwrightEvent]) -> DoraSignals {
    let completions: Vec<&ShipwrightEvent> = events
        .iter()
        .filter(|e| matches!(e.event_type, EventType::PipelineCompleted { .. }))
        .collect();

    if completions.is_empty() {
        return DoraSignals::EMPTY;
    }

    let mut durations_minutes: Vec<f64> = completions
        .iter()
        .filter_map(|e| match &e.event_type {
            EventType::PipelineCompleted { duration_s, .. } => Some(duration_s / 60.0),
            _ => None,
        })
        .collect();
    durations_minutes.sort_by(|a, b| a.total_cmp(b));
    let cycle_time_p50_minutes = percentile_50(&durations_minutes);

    let failures = completions
        .iter()
        .filter(|e| {
            matches!(
                e.event_type,
                EventType::PipelineCompleted {
                    result: PipelineResult::Failure,
                    ..
                }
            )
        })
        .count();
    let change_failure_rate = failures as f64 / completions.len() as f64;

    let span_days = match (completions.first(), completions.last()) {
        (Some(first), Some(last)) => {
            (last.ts_epoch - first.ts_epoch).unsigned_abs() as f64 / 86_400.0
        }
        _ => 0.0,
    };
    let deploy_frequency_per_week = if span_days > 0.0 {
        completions.len() as f64 / span_days * 7.0
    } else {
        // A single-day (or instantaneous) window still has a rate; treat
        // it as "this many deploys in one day" extrapolated to a week.
        completions.len() as f64 * 7.0
    };

    let mttr_minutes = mean_time_to_recovery(&completions);

    DoraSignals {
        deploy_frequency_per_week,
        cycle_time_p50_minutes,
        change_failure_rate,
        mttr_minutes,
    }
}

fn percentile_50(sorted_minutes: &[f64]) -> f64 {
    if sorted_minutes.is_empty() {
        return 0.0;
    }
    let mid = sorted_minutes.len() / 2;
    if sorted_minutes.len() % 2 == 0 {
        (sorted_minutes[mid - 1] + sorted_minutes[mid]) / 2.0
    } else {
        sorted_minutes[mid]
    }
}

fn mean_time_to_recovery(completions: &[&ShipwrightEvent]) -> Option<f64> {
    let mut recoveries = Vec::new();
    let mut pending_failure_ts: Option<i64> = None;

    for event in completions {
        let EventType::PipelineCompleted { result, .. } = &event.event_type else {
            continue;
        };
        match result {
            PipelineResult::Failure => pending_failure_ts = Some(event.ts_epoch),
            PipelineResult::Success => {
                if let Some(failure_ts) = pending_failure_ts.take() {
                    recoveries.push((event.ts_epoch - failure_ts) as f64 / 60.0);
                }
            }
        }
    }

    if recoveries.is_empty() {
        None
    } else {
        Some(recoveries.iter().sum::<f64>() / recoveries.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(ts_epoch: i64, result: PipelineResult, duration_s: f64) -> ShipwrightEvent {
        ShipwrightEvent {
            ts: chrono::DateTime::from_timestamp(ts_epoch, 0).expect("valid timestamp"),
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
    fn empty_window_yields_empty_signals() {
        assert_eq!(compute(&[]), DoraSignals::EMPTY);
    }

    #[test]
    fn change_failure_rate_counts_failures_over_total() {
        let events = vec![
            completion(0, PipelineResult::Success, 600.0),
            completion(100, PipelineResult::Failure, 600.0),
            completion(200, PipelineResult::Success, 600.0),
            completion(300, PipelineResult::Failure, 600.0),
        ];
        let signals = compute(&events);
        assert_eq!(signals.change_failure_rate, 0.5);
    }

    #[test]
    fn cycle_time_p50_is_the_median_duration() {
        let events = vec![
            completion(0, PipelineResult::Success, 60.0),
            completion(100, PipelineResult::Success, 120.0),
            completion(200, PipelineResult::Success, 180.0),
        ];
        let signals = compute(&events);
        assert_eq!(signals.cycle_time_p50_minutes, 2.0);
    }

    #[test]
    fn mttr_averages_failure_to_next_success_gaps() {
        let events = vec![
            completion(0, PipelineResult::Failure, 60.0),
            completion(600, PipelineResult::Success, 60.0), // 10 min later
            completion(1200, PipelineResult::Failure, 60.0),
            completion(3000, PipelineResult::Success, 60.0), // 30 min later
        ];
        let signals = compute(&events);
        assert_eq!(signals.mttr_minutes, Some(20.0));
    }

    #[test]
    fn mttr_is_none_with_no_recovery_pair() {
        let events = vec![completion(0, PipelineResult::Success, 60.0)];
        assert_eq!(compute(&events).mttr_minutes, None);
    }

    #[test]
    fn non_completion_events_are_ignored() {
        let mut events = vec![completion(0, PipelineResult::Success, 60.0)];
        events.push(ShipwrightEvent {
            ts: chrono::DateTime::from_timestamp(50, 0).expect("valid"),
            ts_epoch: 50,
            issue_id: Some(1),
            event_type: EventType::StageStarted {
                stage: "build".to_string(),
            },
        });
        let signals = compute(&events);
        assert_eq!(signals.cycle_time_p50_minutes, 1.0);
    }
}
