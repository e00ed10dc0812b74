//! Fuzz target for model configuration documents.
//!
//! Arbitrary input must be accepted or rejected, never panic.

#![no_main]

use std::path::Path;

use libfuzzer_sys::fuzz_target;
use modelvisor::models::ConfigDocument;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = ConfigDocument::parse(text, Path::new("/models"));
    }
});
