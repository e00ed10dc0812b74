//! Runtime configuration loading from environment variables.
//!
//! All configuration values are loaded from `MODELVISOR_*` environment
//! variables with sensible defaults. Invalid values fall back to defaults
//! without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `MODELVISOR_CONFIG_PATH` | unset | Model configuration JSON |
//! | `MODELVISOR_WATCH_INTERVAL_SECS` | 1 | Watcher period (0 = disabled) |
//! | `MODELVISOR_LOAD_WAIT_MS` | 500 | How long requests wait on a loading version |
//! | `MODELVISOR_LOG_LEVEL` | info | Log filter directive |
//! | `MODELVISOR_LOG_FORMAT` | json | `json` or `pretty` |
//! | `MODELVISOR_LOG_FILE` | unset | Log file (stderr if unset) |
//! | `MODELVISOR_MODEL_ROOT` | unset | Base paths must resolve inside this directory |

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::models::ManagerConfig;
use crate::telemetry::{LogConfig, LogFormat};

/// Upper bound for the request wait on loading versions.
const MAX_LOAD_WAIT_MS: u64 = 600_000;

/// Effective runtime configuration summary (serializable).
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub config_path: Option<PathBuf>,
    pub watch_interval_secs: u64,
    pub load_wait_ms: u64,
    pub log_level: String,
    pub log_format: &'static str,
    pub log_file: Option<PathBuf>,
    pub model_root: Option<PathBuf>,
}

/// All runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    /// `None` disables the watcher.
    pub watch_interval: Option<Duration>,
    pub load_wait: Duration,
    pub log: LogConfig,
    pub model_root: Option<PathBuf>,
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Read a path env var; empty values count as unset.
fn parse_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

/// Load logging configuration from environment.
fn load_log_config() -> LogConfig {
    let level = std::env::var("MODELVISOR_LOG_LEVEL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "info".to_string());
    let format = std::env::var("MODELVISOR_LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse::<LogFormat>().ok())
        .unwrap_or_default();
    LogConfig {
        format,
        level,
        output_path: parse_path("MODELVISOR_LOG_FILE"),
    }
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> EnvConfig {
    let watch_secs = parse_u64("MODELVISOR_WATCH_INTERVAL_SECS", 1);
    let load_wait_ms = parse_u64("MODELVISOR_LOAD_WAIT_MS", 500).min(MAX_LOAD_WAIT_MS);

    EnvConfig {
        config_path: parse_path("MODELVISOR_CONFIG_PATH"),
        watch_interval: (watch_secs > 0).then(|| Duration::from_secs(watch_secs)),
        load_wait: Duration::from_millis(load_wait_ms),
        log: load_log_config(),
        model_root: parse_path("MODELVISOR_MODEL_ROOT"),
    }
}

impl EnvConfig {
    /// Manager settings derived from the environment.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            load_wait: self.load_wait,
            watch_interval: self.watch_interval,
            model_root: self.model_root.clone(),
        }
    }

    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            config_path: self.config_path.clone(),
            watch_interval_secs: self.watch_interval.map(|d| d.as_secs()).unwrap_or(0),
            load_wait_ms: self.load_wait.as_millis() as u64,
            log_level: self.log.level.clone(),
            log_format: self.log.format.as_str(),
            log_file: self.log.output_path.clone(),
            model_root: self.model_root.clone(),
        }
    }
}
