//! SIGINT/SIGTERM shutdown handling.
//!
//! The daemon never reacts to a signal from inside a handler; `signal-hook`
//! just flips an [`AtomicBool`] that the poll loop checks once a second
//! while it sleeps, so a shutdown request is honored within one tick
//! regardless of how long the configured poll interval is. SIGHUP and
//! SIGPIPE are registered as no-ops so a disconnected controlling
//! terminal or a broken pipe from `daemon logs -f` never kills the
//! daemon outright.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use signal_hook::consts::{SIGHUP, SIGINT, SIGPIPE, SIGTERM};
use signal_hook::flag;
use signal_hook::low_level;

/// Install handlers and return the flag the poll loop should check.
/// SIGINT and SIGTERM both set the flag; SIGHUP and SIGPIPE are ignored.
pub fn install() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGINT, Arc::clone(&shutdown)).context("failed to register SIGINT handler")?;
    flag::register(SIGTERM, Arc::clone(&shutdown)).context("failed to register SIGTERM handler")?;
    unsafe {
        low_level::register(SIGHUP, || {}).context("failed to register SIGHUP handler")?;
        low_level::register(SIGPIPE, || {}).context("failed to register SIGPIPE handler")?;
    }
    Ok(shutdown)
}

/// Sleep up to `total` in 1-second ticks, returning early the moment
/// `shutdown` is set. This is what lets a configured 120s poll interval
/// still respond to Ctrl-C within a second.
pub fn interruptible_sleep(total: std::time::Duration, shutdown: &AtomicBool) {
    let mut remaining = total;
    let tick = std::time::Duration::from_secs(1);
    while remaining > std::time::Duration::ZERO {
        if shutdown.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let step = remaining.min(tick);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn interruptible_sleep_returns_immediately_when_already_shutting_down() {
        let flag = AtomicBool::new(true);
        let start = std::time::Instant::now();
        interruptible_sleep(std::time::Duration::from_secs(30), &flag);
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn interruptible_sleep_waits_for_zero_duration_instantly() {
        let flag = AtomicBool::new(false);
        let start = std::time::Instant::now();
        interruptible_sleep(std::time::Duration::ZERO, &flag);
        assert!(start.elapsed() < std::time::Duration::from_millis(200));
        flag.store(false, Ordering::SeqCst); // silence unused warning on some targets
    }
}
