// Copyright 2024-2026 modelvisor Contributors
// SPDX-License-Identifier: Apache-2.0

//! CLI subcommands for the `modelvisor-cli` binary.
//!
//! ## Usage
//!
//! ```bash
//! modelvisor-cli serve                 # Serve MODELVISOR_CONFIG_PATH until Ctrl-C
//! modelvisor-cli validate config.json  # Parse and validate a model config file
//! modelvisor-cli status config.json    # Load every model once and print version states
//! modelvisor-cli config show           # Print effective environment configuration
//! ```

pub mod config_cmd;
pub mod models_cmd;

pub use models_cmd::{run_status, run_validate};

/// Exit code for success.
pub const EXIT_OK: i32 = 0;
/// Exit code when a model failed to load or is not ready.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for an invalid configuration.
pub const EXIT_CONFIG_ERROR: i32 = 2;

/// Value following `flag` in `args`, if present.
pub fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}
