//! Cadence gating for the supervisor's periodic tasks.
//!
//! Each task runs "every N poll cycles"; this module is just the modular
//! arithmetic, kept separate from `lib.rs` so the cadence rules have unit
//! tests of their own, independent from the rest of the poll loop.

/// Fleet config reload: every 3 cycles.
pub const CONFIG_RELOAD_EVERY: u64 = 3;
/// Degradation alert check: every 5 cycles.
pub const DEGRADATION_ALERT_EVERY: u64 = 5;
/// Event-log rotation check: every 10 cycles.
pub const EVENT_ROTATION_EVERY: u64 = 10;

pub fn due(cycle: u64, every: u64) -> bool {
    every > 0 && cycle % every == 0
}

/// Patrol only runs in a genuinely quiet daemon: nothing active, nothing
/// queued, and the configured interval has elapsed since the last run.
pub fn patrol_due(
    active: usize,
    queued: usize,
    last_run: Option<chrono::DateTime<chrono::Utc>>,
    interval: std::time::Duration,
    now: chrono::DateTime<chrono::Utc>,
) -> bool {
    if active != 0 || queued != 0 {
        return false;
    }
    match last_run {
        None => true,
        Some(last) => {
            let elapsed = now.signed_duration_since(last);
            elapsed.num_seconds() >= interval.as_secs() as i64
        }
    }
}
