#![no_main]

use libfuzzer_sys::fuzz_target;
use shipwright_types::{Job, PipelineState, ShipwrightEvent};

fuzz_target!(|data: &[u8]| {
    let Ok(json_str) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(job) = serde_json::from_str::<Job>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&job) {
            if let Ok(parsed) = serde_json::from_str::<Job>(&roundtripped) {
                assert_eq!(job.issue_id, parsed.issue_id);
                assert_eq!(job.pid, parsed.pid);
            }
        }
    }

    if let Ok(event) = serde_json::from_str::<ShipwrightEvent>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&event) {
            if let Ok(parsed) = serde_json::from_str::<ShipwrightEvent>(&roundtripped) {
                assert_eq!(event.issue_id, parsed.issue_id);
                assert_eq!(event.ts_epoch, parsed.ts_epoch);
            }
        }
    }

    if let Ok(state) = serde_json::from_str::<PipelineState>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&state) {
            if let Ok(parsed) = serde_json::from_str::<PipelineState>(&roundtripped) {
                assert_eq!(state.goal, parsed.goal);
                assert_eq!(state.stages.len(), parsed.stages.len());
            }
        }
    }
});
