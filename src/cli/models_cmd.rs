// Copyright 2024-2026 modelvisor Contributors
// SPDX-License-Identifier: Apache-2.0

//! Model CLI subcommands: validate, status.
//!
//! Both work directly on a configuration file without a running server.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config;
use crate::models::{
    ConfigDocument, Manager, ManagerConfig, MmapBackend, ModelConfig, VersionStatusReport,
};

/// How long `status` waits for loads to settle.
const STATUS_SETTLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Parse and validate a configuration file, printing the models it declares.
///
/// Returns exit code: 0 when valid, 2 on a configuration error.
pub fn run_validate(path: &Path) -> i32 {
    match ConfigDocument::from_file(path) {
        Ok(document) => {
            print!("{}", format_models(&document.models));
            println!("Configuration is valid.");
            super::EXIT_OK
        }
        Err(e) => {
            eprintln!("Invalid configuration {}: {}", path.display(), e);
            super::EXIT_CONFIG_ERROR
        }
    }
}

/// Load every configured model once and print the resulting version states.
///
/// Returns exit code: 0 when every model loaded, 1 if any version or model
/// failed, 2 on a configuration error.
pub async fn run_status(path: &Path, json: bool) -> i32 {
    let mut manager_config = config::load().manager_config();
    manager_config.watch_interval = None;
    status_with(path, json, manager_config).await
}

async fn status_with(path: &Path, json: bool, manager_config: ManagerConfig) -> i32 {
    let manager = Manager::new(manager_config, Arc::new(MmapBackend::new()));

    let report = match manager.load_configuration(path).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Invalid configuration {}: {}", path.display(), e);
            return super::EXIT_CONFIG_ERROR;
        }
    };
    for (model, error) in &report.failures {
        eprintln!("WARNING: {model}: {error}");
    }
    if !manager.wait_for_settled(STATUS_SETTLE_TIMEOUT).await {
        eprintln!("WARNING: some versions were still loading after {}s", STATUS_SETTLE_TIMEOUT.as_secs());
    }

    let statuses = manager.all_statuses();
    if json {
        match serde_json::to_string_pretty(&statuses) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("Failed to serialize status: {e}"),
        }
    } else {
        print!("{}", format_statuses(&statuses));
    }

    let any_failed = statuses
        .values()
        .flatten()
        .any(|r| r.error_code.is_some());
    manager.shutdown();

    if any_failed || !report.is_clean() {
        super::EXIT_FAILURE
    } else {
        super::EXIT_OK
    }
}

fn format_models(models: &[ModelConfig]) -> String {
    if models.is_empty() {
        return "No models configured.\n".to_string();
    }
    let mut out = format!("{:<24} {:<10} {:<16} {}\n", "NAME", "DEVICE", "POLICY", "BASE PATH");
    out.push_str(&"-".repeat(72));
    out.push('\n');
    for m in models {
        out.push_str(&format!(
            "{:<24} {:<10} {:<16} {}\n",
            truncate(&m.name, 23),
            truncate(&m.version.target_device, 9),
            truncate(&m.version_policy.to_string(), 15),
            m.version.base_path.display()
        ));
    }
    out
}

fn format_statuses(statuses: &BTreeMap<String, Vec<VersionStatusReport>>) -> String {
    if statuses.is_empty() {
        return "No models loaded.\n".to_string();
    }
    let mut out = format!("{:<24} {:>8} {:<12} {}\n", "NAME", "VERSION", "STATE", "ERROR");
    out.push_str(&"-".repeat(64));
    out.push('\n');
    for (name, reports) in statuses {
        if reports.is_empty() {
            out.push_str(&format!("{:<24} {:>8} {:<12} {}\n", truncate(name, 23), "-", "-", "no versions"));
            continue;
        }
        for r in reports {
            out.push_str(&format!(
                "{:<24} {:>8} {:<12} {}\n",
                truncate(name, 23),
                r.version,
                r.state.as_str(),
                r.error_code.map(|c| c.as_str()).unwrap_or("")
            ));
        }
    }
    out
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
