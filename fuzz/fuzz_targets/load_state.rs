#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use shipwright_state::{state_path, StateStore};
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    if fs::write(state_path(td.path()), data).is_ok() {
        let _ = StateStore::new(td.path()).load();
    }
});
