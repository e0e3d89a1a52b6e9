//! Fuzz target for configuration loading.
//!
//! This tests that deserializing and validating arbitrary JSON never panics.

#![no_main]

use coordination_engine::CoordinationConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(config) = serde_json::from_slice::<CoordinationConfig>(data) {
        // Should never panic, valid or not
        let _ = config.validate();
        let _ = config.session.session_ttl_duration();
    }
});
