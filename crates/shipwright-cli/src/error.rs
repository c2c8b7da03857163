//! The handful of error kinds a caller (or the CLI's own exit-code
//! mapping) needs to match on programmatically. Everything else in this
//! crate propagates as a plain `anyhow::Error` with `.context(...)`
//! breadcrumbs — this enum exists only for the cases where "what kind
//! of failure was this" matters more than "what's the message".

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShipwrightError {
    #[error("timed out waiting for lock at {path}")]
    LockTimeout { path: PathBuf },

    #[error("{source} authentication failed")]
    AuthFailure { source: &'static str },

    #[error("budget exceeded; pipeline paused and resumable")]
    BudgetExceeded,

    #[error("invalid config field `{field}`: {reason}")]
    ConfigInvalid { field: String, reason: String },
}

impl ShipwrightError {
    /// Exit code: `2` for a resumable budget pause, `1` for
    /// everything else this enum names. Errors that never make it into
    /// this enum (the anyhow fallback) also exit `1`.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShipwrightError::BudgetExceeded => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exceeded_exits_two() {
        assert_eq!(ShipwrightError::BudgetExceeded.exit_code(), 2);
    }

    #[test]
    fn other_variants_exit_one() {
        assert_eq!(
            ShipwrightError::LockTimeout { path: PathBuf::from("/tmp/x") }.exit_code(),
            1
        );
        assert_eq!(ShipwrightError::AuthFailure { source: "tracker" }.exit_code(), 1);
        assert_eq!(
            ShipwrightError::ConfigInvalid { field: "x".into(), reason: "y".into() }.exit_code(),
            1
        );
    }
}
