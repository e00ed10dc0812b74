// Copyright 2024-2026 modelvisor Contributors
// SPDX-License-Identifier: Apache-2.0

//! Config CLI subcommands: show, defaults.
//!
//! These commands read configuration directly from environment variables.

use crate::config::{self, EffectiveConfig};

/// Print effective config to stdout, as key-value pairs or JSON.
pub fn run_show(json: bool) -> i32 {
    let cfg = config::load().effective_config();
    if json {
        match serde_json::to_string_pretty(&cfg) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("Failed to serialize configuration: {e}");
                return super::EXIT_FAILURE;
            }
        }
    } else {
        print!("{}", format_config(&cfg));
    }
    super::EXIT_OK
}

/// Print default config values (no env overrides) to stdout.
pub fn run_defaults() {
    println!("MODELVISOR_CONFIG_PATH=");
    println!("MODELVISOR_WATCH_INTERVAL_SECS=1");
    println!("MODELVISOR_LOAD_WAIT_MS=500");
    println!("MODELVISOR_LOG_LEVEL=info");
    println!("MODELVISOR_LOG_FORMAT=json");
    println!("MODELVISOR_LOG_FILE=");
    println!("MODELVISOR_MODEL_ROOT=");
}

fn format_config(cfg: &EffectiveConfig) -> String {
    let path = |p: &Option<std::path::PathBuf>| {
        p.as_ref().map(|p| p.display().to_string()).unwrap_or_default()
    };
    let mut out = String::new();
    out.push_str(&format!("MODELVISOR_CONFIG_PATH={}\n", path(&cfg.config_path)));
    out.push_str(&format!("MODELVISOR_WATCH_INTERVAL_SECS={}\n", cfg.watch_interval_secs));
    out.push_str(&format!("MODELVISOR_LOAD_WAIT_MS={}\n", cfg.load_wait_ms));
    out.push_str(&format!("MODELVISOR_LOG_LEVEL={}\n", cfg.log_level));
    out.push_str(&format!("MODELVISOR_LOG_FORMAT={}\n", cfg.log_format));
    out.push_str(&format!("MODELVISOR_LOG_FILE={}\n", path(&cfg.log_file)));
    out.push_str(&format!("MODELVISOR_MODEL_ROOT={}\n", path(&cfg.model_root)));
    out
}
