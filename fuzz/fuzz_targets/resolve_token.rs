#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use shipwright_auth::{resolve_token, CREDENTIALS_FILE};
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    if fs::write(td.path().join(CREDENTIALS_FILE), data).is_err() {
        return;
    }

    temp_env::with_vars(
        [
            ("SHIPWRIGHT_TRACKER_TOKEN", None::<&str>),
            ("GITHUB_TOKEN", None::<&str>),
        ],
        || {
            let _ = resolve_token("tracker", Some(td.path()));
        },
    );
});
