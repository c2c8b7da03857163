//! Reap classification and retry escalation.

use shipwright_retry::{classify_failure, retry_config_for_class, FailureClass};
use shipwright_types::{Job, RetryRecord};

use crate::launcher::parse_outcome_marker;

/// Outcome of reaping one job's exit, before any state mutation.
#[derive(Debug, Clone)]
pub enum ReapOutcome {
    Success,
    /// Failed and should be retried as a new job.
    Retry {
        class: FailureClass,
        attempt: u32,
        escalate_model: bool,
        escalate_template: bool,
    },
    /// Failed, and retries are exhausted or the class is non-retryable.
    Terminal { class: FailureClass },
}

/// Decide whether an exited job succeeded or failed, consulting the
/// canonical log marker first and falling back to the `wait()` exit
/// code only when no marker is present (subprocess reparenting —
/// an ambiguous reap defaults to failure, never success).
pub fn determine_success(log_tail: &str, wait_exit_success: Option<bool>) -> bool {
    match parse_outcome_marker(log_tail) {
        Some(success) => success,
        None => wait_exit_success.unwrap_or(false),
    }
}

/// Classify a failed job and decide the retry policy.
///
/// `prior` is the issue's existing [`RetryRecord`], if any (cleared on a
/// prior success). `default_max_retries` is `config.max_retries`, used
/// for `BuildFailure`/`Unknown` classes. `escalation_enabled` gates the
/// model/template escalation that otherwise always applies to retries.
pub fn classify_and_plan_retry(
    log_tail: &str,
    prior: Option<&RetryRecord>,
    default_max_retries: u32,
    escalation_enabled: bool,
) -> ReapOutcome {
    let class = classify_failure(log_tail);
    let attempt = prior.map(|r| r.attempt_count).unwrap_or(0) + 1;

    let Some(_policy) = retry_config_for_class(class, default_max_retries) else {
        return ReapOutcome::Terminal { class };
    };

    let max_retries = match class {
        FailureClass::ApiError => 4,
        FailureClass::ContextExhaustion => 2,
        FailureClass::BuildFailure | FailureClass::Unknown => default_max_retries,
        FailureClass::AuthError | FailureClass::InvalidIssue => 0,
    };

    if attempt > max_retries {
        return ReapOutcome::Terminal { class };
    }

    ReapOutcome::Retry {
        class,
        attempt,
        escalate_model: escalation_enabled && attempt == 1,
        escalate_template: escalation_enabled && attempt >= 2,
    }
}

/// Whether a checkpoint file exists for `job`'s workspace, meaning the
/// retry spawn should pass `--resume` rather than starting cold
/// "Resume from checkpoint").
pub fn has_checkpoint(job: &Job) -> bool {
    shipwright_pipeline::state_path(&job.workspace_path).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn determine_success_prefers_marker_over_exit_code() {
        assert!(determine_success("SHIPWRIGHT_PIPELINE_RESULT=success", Some(false)));
        assert!(!determine_success("SHIPWRIGHT_PIPELINE_RESULT=failure:BuildFailure", Some(true)));
    }

    #[test]
    fn determine_success_falls_back_to_exit_code_when_no_marker() {
        assert!(determine_success("no marker here", Some(true)));
        assert!(!determine_success("no marker here", Some(false)));
    }

    #[test]
    fn determine_success_defaults_to_failure_when_fully_ambiguous() {
        assert!(!determine_success("no marker here", None));
    }

    #[test]
    fn auth_error_is_terminal_with_zero_retries() {
        let outcome = classify_and_plan_retry("401 unauthorized", None, 3, true);
        assert!(matches!(outcome, ReapOutcome::Terminal { class: FailureClass::AuthError }));
    }

    #[test]
    fn build_failure_retries_up_to_default_max() {
        let outcome = classify_and_plan_retry("test failed: assertion", None, 2, true);
        assert!(matches!(
            outcome,
            ReapOutcome::Retry { class: FailureClass::BuildFailure, attempt: 1, escalate_model: true, .. }
        ));
    }

    #[test]
    fn second_retry_escalates_template_not_model() {
        let prior = RetryRecord {
            issue_id: 1,
            attempt_count: 1,
            last_failure_class: Some(FailureClass::BuildFailure),
            max_retries_for_class: 2,
        };
        let outcome = classify_and_plan_retry("compile error", Some(&prior), 2, true);
        match outcome {
            ReapOutcome::Retry { attempt, escalate_model, escalate_template, .. } => {
                assert_eq!(attempt, 2);
                assert!(!escalate_model);
                assert!(escalate_template);
            }
            _ => panic!("expected retry"),
        }
    }

    #[test]
    fn retries_exhausted_becomes_terminal() {
        let prior = RetryRecord {
            issue_id: 1,
            attempt_count: 2,
            last_failure_class: Some(FailureClass::BuildFailure),
            max_retries_for_class: 2,
        };
        let outcome = classify_and_plan_retry("compile error", Some(&prior), 2, true);
        assert!(matches!(outcome, ReapOutcome::Terminal { class: FailureClass::BuildFailure }));
    }
}
