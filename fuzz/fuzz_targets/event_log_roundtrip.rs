#![no_main]

use libfuzzer_sys::fuzz_target;
use shipwright_events::EventLog;
use shipwright_types::{EventType, ShipwrightEvent};
use tempfile::tempdir;

fuzz_target!(|data: (u64, u32, u8)| {
    let (issue_id, pid, template_byte) = data;
    let template = match template_byte % 3 {
        0 => "fast",
        1 => "standard",
        _ => "full",
    };

    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };
    let path = td.path().join("events.jsonl");

    let mut log = EventLog::new();
    log.record(ShipwrightEvent::new(
        EventType::DaemonSpawn { pid, template: template.to_string() },
        Some(issue_id),
    ));
    if log.write_to_file(&path).is_err() {
        return;
    }

    // Append-only: a second write must only grow the file, never replace it.
    let before = EventLog::read_from_file(&path).unwrap().len();
    log.write_to_file(&path).unwrap();
    let after = EventLog::read_from_file(&path).unwrap().len();
    assert!(after >= before);
});
