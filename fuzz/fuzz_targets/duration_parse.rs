#![no_main]

use libfuzzer_sys::fuzz_target;
use shipwright_duration::{format_duration, parse_duration};

fuzz_target!(|input: &str| {
    if let Ok(duration) = parse_duration(input) {
        let formatted = format_duration(duration);
        // Reformatting a parsed duration must itself parse back cleanly.
        assert!(parse_duration(&formatted).is_ok());
    }
});
