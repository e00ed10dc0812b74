//! Parsing and validation of the model configuration document.
//!
//! The document is all-or-nothing: one bad entry rejects the whole file and
//! the caller keeps whatever configuration it was serving before.
//!
//! ```json
//! {
//!   "model_config_list": [
//!     { "config": { "name": "resnet", "base_path": "models/resnet",
//!                   "batch_size": "auto", "model_version_policy": { "latest": { "num_versions": 2 } } } }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::model_config::{
    normalize_layout, BatchSize, ModelConfig, ShapePolicy, StatefulParams, VersionConfig,
    ANONYMOUS_INPUT, DEFAULT_TARGET_DEVICE,
};
use super::policy::VersionPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file unreadable: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration is not a valid model config document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Model name cannot be empty")]
    EmptyName,

    #[error("Duplicate model name: {0}")]
    DuplicateModel(String),

    #[error("Model {model}: invalid {parameter}: {reason}")]
    InvalidParameter {
        model: String,
        parameter: &'static str,
        reason: String,
    },

    #[error("Model {model}: {parameter} set for non stateful model")]
    NonStatefulParameter { model: String, parameter: &'static str },

    #[error("Model {model}: stateful model cannot use {reason}")]
    StatefulIncompatible { model: String, reason: String },

    #[error("Model {model}: invalid version policy: {reason}")]
    InvalidVersionPolicy { model: String, reason: String },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDocument {
    model_config_list: Vec<RawEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEntry {
    config: RawModelConfig,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrMap {
    Single(String),
    PerInput(BTreeMap<String, String>),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLatest {
    num_versions: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSpecific {
    versions: Vec<u64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawVersionPolicy {
    all: Option<serde_json::Map<String, Value>>,
    latest: Option<RawLatest>,
    specific: Option<RawSpecific>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawModelConfig {
    name: String,
    base_path: String,
    target_device: Option<String>,
    batch_size: Option<Value>,
    shape: Option<StringOrMap>,
    layout: Option<StringOrMap>,
    nireq: Option<u32>,
    plugin_config: Option<BTreeMap<String, Value>>,
    stateful: Option<bool>,
    max_sequence_number: Option<u32>,
    low_latency_transformation: Option<bool>,
    idle_sequence_cleanup: Option<bool>,
    model_version_policy: Option<RawVersionPolicy>,
}

/// A validated configuration document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDocument {
    pub models: Vec<ModelConfig>,
}

impl ConfigDocument {
    /// Read and validate a document from disk.
    ///
    /// Relative base paths resolve against the document's directory.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let root = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&text, root)
    }

    /// Parse and validate a document, resolving relative base paths against `root`.
    pub fn parse(text: &str, root: &Path) -> Result<Self, ConfigError> {
        let raw: RawDocument = serde_json::from_str(text)?;
        let mut seen = HashSet::new();
        let mut models = Vec::with_capacity(raw.model_config_list.len());

        for entry in raw.model_config_list {
            let model = convert_model(entry.config, root)?;
            if !seen.insert(model.name.clone()) {
                return Err(ConfigError::DuplicateModel(model.name));
            }
            models.push(model);
        }

        Ok(Self { models })
    }
}

fn convert_model(raw: RawModelConfig, root: &Path) -> Result<ModelConfig, ConfigError> {
    let name = raw.name.trim().to_string();
    if name.is_empty() {
        return Err(ConfigError::EmptyName);
    }
    let invalid = |parameter: &'static str, reason: String| ConfigError::InvalidParameter {
        model: name.clone(),
        parameter,
        reason,
    };

    if raw.base_path.trim().is_empty() {
        return Err(invalid("base_path", "cannot be empty".into()));
    }
    let base_path = PathBuf::from(raw.base_path.trim());
    let base_path = if base_path.is_relative() { root.join(base_path) } else { base_path };

    let mut version = VersionConfig::new(base_path);
    version.stateful = convert_stateful(&name, &raw)?;
    version.target_device = raw
        .target_device
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| DEFAULT_TARGET_DEVICE.to_string());

    if let Some(value) = raw.batch_size {
        version.batch_size = Some(parse_batch_size(&value).map_err(|r| invalid("batch_size", r))?);
    }

    match raw.shape {
        Some(StringOrMap::Single(text)) => {
            let shape = ShapePolicy::parse(&text).map_err(|r| invalid("shape", r))?;
            version.shapes.insert(ANONYMOUS_INPUT.to_string(), shape);
        }
        Some(StringOrMap::PerInput(map)) => {
            for (input, text) in map {
                let shape = ShapePolicy::parse(&text).map_err(|r| invalid("shape", r))?;
                version.shapes.insert(input, shape);
            }
        }
        None => {}
    }

    if version.batch_size.is_some() && !version.shapes.is_empty() {
        tracing::warn!(
            model = %name,
            "both shape and batch_size are set; batch_size is ignored"
        );
        version.batch_size = None;
    }

    match raw.layout {
        Some(StringOrMap::Single(text)) => {
            version.layout = Some(normalize_layout(&text).map_err(|r| invalid("layout", r))?);
        }
        Some(StringOrMap::PerInput(map)) => {
            for (input, text) in map {
                let layout = normalize_layout(&text).map_err(|r| invalid("layout", r))?;
                version.layouts.insert(input, layout);
            }
        }
        None => {}
    }

    version.nireq = raw.nireq.unwrap_or(0);

    if let Some(plugin) = raw.plugin_config {
        for (key, value) in plugin {
            let value = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => {
                    return Err(invalid(
                        "plugin_config",
                        format!("value of {} must be a scalar, got {}", key, other),
                    ))
                }
            };
            version.plugin_config.insert(key, value);
        }
    }

    if version.is_stateful() && version.is_dynamic() {
        return Err(ConfigError::StatefulIncompatible {
            model: name,
            reason: "automatic batch size or dynamic shape".into(),
        });
    }

    let version_policy = match raw.model_version_policy {
        Some(policy) => convert_policy(&name, policy)?,
        None => VersionPolicy::default(),
    };

    Ok(ModelConfig { name, version_policy, version })
}

fn parse_batch_size(value: &Value) -> Result<BatchSize, String> {
    match value {
        Value::String(s) if s.trim().eq_ignore_ascii_case("auto") => Ok(BatchSize::Auto),
        Value::String(s) => match s.trim().parse::<u64>() {
            Ok(n) if n > 0 => Ok(BatchSize::Fixed(n)),
            _ => Err(format!("expected 'auto' or a positive integer, got {}", s)),
        },
        Value::Number(n) => match n.as_u64() {
            Some(n) if n > 0 => Ok(BatchSize::Fixed(n)),
            _ => Err(format!("expected a positive integer, got {}", n)),
        },
        other => Err(format!("expected 'auto' or a positive integer, got {}", other)),
    }
}

fn convert_stateful(name: &str, raw: &RawModelConfig) -> Result<Option<StatefulParams>, ConfigError> {
    if !raw.stateful.unwrap_or(false) {
        let stray = [
            ("max_sequence_number", raw.max_sequence_number.is_some()),
            ("low_latency_transformation", raw.low_latency_transformation.is_some()),
            ("idle_sequence_cleanup", raw.idle_sequence_cleanup.is_some()),
        ];
        if let Some((parameter, _)) = stray.iter().find(|(_, set)| *set) {
            return Err(ConfigError::NonStatefulParameter {
                model: name.to_string(),
                parameter: *parameter,
            });
        }
        return Ok(None);
    }

    let defaults = StatefulParams::default();
    Ok(Some(StatefulParams {
        max_sequence_number: raw.max_sequence_number.unwrap_or(defaults.max_sequence_number),
        low_latency_transformation: raw
            .low_latency_transformation
            .unwrap_or(defaults.low_latency_transformation),
        idle_sequence_cleanup: raw.idle_sequence_cleanup.unwrap_or(defaults.idle_sequence_cleanup),
    }))
}

fn convert_policy(name: &str, raw: RawVersionPolicy) -> Result<VersionPolicy, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidVersionPolicy {
        model: name.to_string(),
        reason: reason.to_string(),
    };
    match (raw.all, raw.latest, raw.specific) {
        (Some(all), None, None) => {
            if all.is_empty() {
                Ok(VersionPolicy::All)
            } else {
                Err(invalid("'all' takes no parameters"))
            }
        }
        (None, Some(latest), None) => {
            if latest.num_versions == 0 {
                return Err(invalid("num_versions must be at least 1"));
            }
            Ok(VersionPolicy::Latest { num_versions: latest.num_versions })
        }
        (None, None, Some(specific)) => {
            let versions: BTreeSet<u64> = specific.versions.into_iter().collect();
            if versions.is_empty() || versions.contains(&0) {
                return Err(invalid("versions must be a non-empty list of positive numbers"));
            }
            Ok(VersionPolicy::Specific { versions })
        }
        _ => Err(invalid("exactly one of 'all', 'latest' or 'specific' is required")),
    }
}
