//! Process-level logging for the daemon and its CLI.
//!
//! Distinct from the structured event log (`shipwright-events`), which
//! is the durable audit trail consumed by dashboards and `daemon
//! metrics`: this is what an operator watching stderr actually sees.

use chrono::Utc;

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
    /// Structured key-value context alongside a message, e.g. for a
    /// poll-cycle summary (`spawned=2 enqueued=1 reaped=3`).
    fn detail(&mut self, msg: &str, fields: &[(&str, &str)]);
}

pub struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("{} [info] {msg}", Utc::now().to_rfc3339());
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("{} [warn] {msg}", Utc::now().to_rfc3339());
    }

    fn error(&mut self, msg: &str) {
        eprintln!("{} [error] {msg}", Utc::now().to_rfc3339());
    }

    fn detail(&mut self, msg: &str, fields: &[(&str, &str)]) {
        let rendered: Vec<String> = fields.iter().map(|(k, v)| format!("{k}={v}")).collect();
        eprintln!("{} [info] {msg} {}", Utc::now().to_rfc3339(), rendered.join(" "));
    }
}
