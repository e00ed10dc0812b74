//! Fuzz target for shape and layout strings.

#![no_main]

use libfuzzer_sys::fuzz_target;
use modelvisor::models::{normalize_layout, ShapePolicy};

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(shape) = ShapePolicy::parse(text) {
            // Display output must parse back to the same policy
            assert_eq!(ShapePolicy::parse(&shape.to_string()).ok(), Some(shape));
        }
        let _ = normalize_layout(text);
    }
});
