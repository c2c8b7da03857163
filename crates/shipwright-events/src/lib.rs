//! Append-only, size-rotated event log for the Shipwright daemon.
//!
//! Every component writes [`ShipwrightEvent`] records here as newline-delimited
//! JSON. Writes are append-only and best-effort: a failed append is
//! logged via the caller's `Reporter` and never aborts a poll cycle (the
//! daemon's liveness outranks a perfect audit trail). Rotation keeps the
//! file from growing unbounded: once `events.jsonl` crosses 50 MiB it is
//! renamed to `.1` (existing `.1`/`.2` shift up, `.3` is dropped) and a
//! fresh `events.jsonl` is started. [`EventLog::read_all`] reads every
//! non-rotated and rotated file in chronological order, which is what
//! `daemon metrics`/`daemon logs` need.
//!
//! # Example
//!
//! ```
//! use shipwright_events::{EventLog, events_path};
//! use shipwright_types::{ShipwrightEvent, EventType};
//!
//! let mut log = EventLog::new();
//! log.record(ShipwrightEvent::new(
//!     EventType::PipelineStarted { template: "fast".to_string() },
//!     Some(42),
//! ));
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use shipwright_types::ShipwrightEvent;

pub mod dora;

/// Default events file name.
pub const EVENTS_FILE: &str = "events.jsonl";

/// Rotate once the active file reaches this size.
pub const ROTATE_AT_BYTES: u64 = 50 * 1024 * 1024;

/// Number of rotated generations kept (`.1`, `.2`, `.3`); the oldest is
/// dropped when a new rotation would exceed this.
pub const KEPT_ROTATIONS: u32 = 3;

/// Get the events file path for a state directory.
pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// In-memory buffer of events not yet flushed, plus the file-append and
/// rotation logic.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<ShipwrightEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: ShipwrightEvent) {
        self.events.push(event);
    }

    /// Append every buffered event to `path` as JSONL, rotating first if
    /// the existing file is already past [`ROTATE_AT_BYTES`]. Does not
    /// clear the in-memory buffer; callers that stream-append per event
    /// typically call [`Self::record`] then immediately
    /// [`Self::write_to_file`] then [`Self::clear`].
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        rotate_if_oversized(path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);
        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
            writeln!(writer, "{line}").context("failed to write event line")?;
        }
        writer.flush().context("failed to flush events file")?;

        Ok(())
    }

    /// Read events from a single JSONL file (no rotation traversal). Used
    /// internally by [`Self::read_all`] and directly by tests.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();

        for line in reader.lines() {
            let line = line.with_context(|| {
                format!("failed to read line from events file {}", path.display())
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let event: ShipwrightEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {line}"))?;
            events.push(event);
        }

        Ok(Self { events })
    }

    /// Read every rotated generation plus the active file, oldest first,
    /// as `daemon metrics`/`daemon logs` want.
    pub fn read_all(path: &Path) -> Result<Self> {
        let mut events = Vec::new();
        for gen in (1..=KEPT_ROTATIONS).rev() {
            let rotated = rotated_path(path, gen);
            if rotated.exists() {
                events.extend(Self::read_from_file(&rotated)?.events);
            }
        }
        events.extend(Self::read_from_file(path)?.events);
        Ok(Self { events })
    }

    pub fn events_for_issue(&self, issue_id: u64) -> Vec<&ShipwrightEvent> {
        self.events
            .iter()
            .filter(|e| e.issue_id == Some(issue_id))
            .collect()
    }

    pub fn all_events(&self) -> &[ShipwrightEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

fn rotated_path(path: &Path, generation: u32) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(format!(".{generation}"));
    PathBuf::from(os)
}

/// If `path` exists and is at or past [`ROTATE_AT_BYTES`], shift
/// `.1 -> .2 -> .3` (dropping the old `.3`) and move `path` to `.1`,
/// leaving the caller to create a fresh file at `path`.
fn rotate_if_oversized(path: &Path) -> Result<()> {
    let Ok(metadata) = fs::metadata(path) else {
        return Ok(());
    };
    if metadata.len() < ROTATE_AT_BYTES {
        return Ok(());
    }

    let oldest = rotated_path(path, KEPT_ROTATIONS);
    if oldest.exists() {
        fs::remove_file(&oldest)
            .with_context(|| format!("failed to drop oldest rotation {}", oldest.display()))?;
    }

    for gen in (1..KEPT_ROTATIONS).rev() {
        let from = rotated_path(path, gen);
        let to = rotated_path(path, gen + 1);
        if from.exists() {
            fs::rename(&from, &to)
                .with_context(|| format!("failed to rotate {} -> {}", from.display(), to.display()))?;
        }
    }

    fs::rename(path, rotated_path(path, 1))
        .with_context(|| format!("failed to rotate {} into .1", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_types::EventType;
    use tempfile::tempdir;

    fn sample_event(issue_id: u64) -> ShipwrightEvent {
        ShipwrightEvent::new(
            EventType::StageStarted {
                stage: "build".to_string(),
            },
            Some(issue_id),
        )
    }

    #[test]
    fn new_event_log_is_empty() {
        let log = EventLog::new();
        assert!(log.is_empty());
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn record_adds_event_to_log() {
        let mut log = EventLog::new();
        log.record(sample_event(1));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn events_for_issue_filters_correctly() {
        let mut log = EventLog::new();
        log.record(sample_event(1));
        log.record(sample_event(2));
        log.record(sample_event(1));

        assert_eq!(log.events_for_issue(1).len(), 2);
        assert_eq!(log.events_for_issue(2).len(), 1);
        assert_eq!(log.events_for_issue(3).len(), 0);
    }

    #[test]
    fn write_to_file_creates_jsonl_format() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events.jsonl");

        let mut log = EventLog::new();
        log.record(sample_event(1));
        log.write_to_file(&path).expect("write");

        let content = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        let _: ShipwrightEvent = serde_json::from_str(lines[0]).expect("parse");
    }

    #[test]
    fn write_to_file_appends_to_existing_file() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events.jsonl");

        let mut log1 = EventLog::new();
        log1.record(sample_event(1));
        log1.write_to_file(&path).expect("write first");

        let mut log2 = EventLog::new();
        log2.record(sample_event(2));
        log2.write_to_file(&path).expect("write second");

        let content = fs::read_to_string(&path).expect("read");
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn read_from_file_loads_all_events() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events.jsonl");

        let mut log = EventLog::new();
        log.record(sample_event(1));
        log.record(sample_event(2));
        log.write_to_file(&path).expect("write");

        let loaded = EventLog::read_from_file(&path).expect("read");
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn read_from_file_returns_empty_log_when_missing() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("nonexistent.jsonl");
        let loaded = EventLog::read_from_file(&path).expect("read");
        assert!(loaded.is_empty());
    }

    #[test]
    fn rotation_shifts_generations_and_drops_oldest() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events.jsonl");

        fs::write(&path, vec![b'x'; (ROTATE_AT_BYTES + 1) as usize]).unwrap();
        fs::write(rotated_path(&path, 1), "gen1").unwrap();
        fs::write(rotated_path(&path, 2), "gen2").unwrap();
        fs::write(rotated_path(&path, 3), "gen3-to-be-dropped").unwrap();

        let mut log = EventLog::new();
        log.record(sample_event(1));
        log.write_to_file(&path).expect("write triggers rotation");

        assert_eq!(fs::read_to_string(rotated_path(&path, 1)).unwrap(), "gen1");
        assert_eq!(fs::read_to_string(rotated_path(&path, 2)).unwrap(), "gen2");
        assert_eq!(fs::read_to_string(rotated_path(&path, 3)).unwrap(), "gen1");
        assert!(fs::read_to_string(&path).unwrap().lines().count() == 1);
    }

    #[test]
    fn read_all_reads_rotations_oldest_first() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events.jsonl");

        let mut rotated_log = EventLog::new();
        rotated_log.record(sample_event(100));
        rotated_log.write_to_file(&rotated_path(&path, 2)).unwrap();

        let mut active_log = EventLog::new();
        active_log.record(sample_event(200));
        active_log.write_to_file(&path).unwrap();

        let all = EventLog::read_all(&path).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.all_events()[0].issue_id, Some(100));
        assert_eq!(all.all_events()[1].issue_id, Some(200));
    }

    #[test]
    fn path_helper_returns_expected_path() {
        let base = PathBuf::from("x");
        assert_eq!(events_path(&base), PathBuf::from("x").join(EVENTS_FILE));
    }

    #[test]
    fn clear_removes_all_events() {
        let mut log = EventLog::new();
        log.record(sample_event(1));
        log.record(sample_event(2));
        assert_eq!(log.len(), 2);
        log.clear();
        assert!(log.is_empty());
    }
}
