//! Desired per-model configuration and the immutable per-version load config.
//!
//! `VersionConfig` is the snapshot an instance is created from. Two snapshots
//! are compared field by field to decide whether a running version must be
//! reloaded; the stateful flag is deliberately left out of that comparison
//! because flipping it is an incompatibility, not a reload.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use super::policy::VersionPolicy;

/// Input name used when a shape or layout is given without naming an input.
pub const ANONYMOUS_INPUT: &str = "";

/// Device used when the configuration names none.
pub const DEFAULT_TARGET_DEVICE: &str = "CPU";

/// Batching mode of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSize {
    /// Batch dimension follows each request.
    Auto,
    Fixed(u64),
}

impl fmt::Display for BatchSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchSize::Auto => write!(f, "auto"),
            BatchSize::Fixed(n) => write!(f, "{}", n),
        }
    }
}

/// One dimension of a configured input shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Static(u64),
    Range { min: u64, max: u64 },
    Any,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Static(n) => write!(f, "{}", n),
            Dimension::Range { min, max } => write!(f, "{}:{}", min, max),
            Dimension::Any => write!(f, "-1"),
        }
    }
}

/// Shape policy of one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapePolicy {
    /// Reshape to whatever each request carries.
    Auto,
    Fixed(Vec<u64>),
    /// At least one dimension is a range or unbounded.
    Range(Vec<Dimension>),
}

impl ShapePolicy {
    pub fn is_dynamic(&self) -> bool {
        !matches!(self, ShapePolicy::Fixed(_))
    }

    /// Parse `auto`, `(1,3,224,224)`, `[1,3,200:300,-1]` and similar.
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        if text.eq_ignore_ascii_case("auto") {
            return Ok(ShapePolicy::Auto);
        }
        let inner = text
            .strip_prefix('(')
            .and_then(|t| t.strip_suffix(')'))
            .or_else(|| text.strip_prefix('[').and_then(|t| t.strip_suffix(']')))
            .ok_or_else(|| format!("shape must be 'auto' or enclosed in parentheses: {}", text))?;

        let mut dims = Vec::new();
        for part in inner.split(',') {
            dims.push(parse_dimension(part.trim())?);
        }
        if dims.is_empty() {
            return Err("shape has no dimensions".into());
        }

        if dims.iter().all(|d| matches!(d, Dimension::Static(_))) {
            let fixed = dims
                .into_iter()
                .filter_map(|d| match d {
                    Dimension::Static(n) => Some(n),
                    _ => None,
                })
                .collect();
            Ok(ShapePolicy::Fixed(fixed))
        } else {
            Ok(ShapePolicy::Range(dims))
        }
    }
}

fn parse_dimension(part: &str) -> Result<Dimension, String> {
    if part == "-1" {
        return Ok(Dimension::Any);
    }
    if let Some((lo, hi)) = part.split_once(':') {
        let min = lo.trim().parse::<u64>().map_err(|_| format!("invalid range bound: {}", part))?;
        let max = hi.trim().parse::<u64>().map_err(|_| format!("invalid range bound: {}", part))?;
        if min > max {
            return Err(format!("range lower bound exceeds upper bound: {}", part));
        }
        return Ok(Dimension::Range { min, max });
    }
    part.parse::<u64>()
        .map(Dimension::Static)
        .map_err(|_| format!("invalid dimension: {}", part))
}

impl fmt::Display for ShapePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapePolicy::Auto => write!(f, "auto"),
            ShapePolicy::Fixed(dims) => {
                let dims: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
                write!(f, "({})", dims.join(","))
            }
            ShapePolicy::Range(dims) => {
                let dims: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
                write!(f, "({})", dims.join(","))
            }
        }
    }
}

fn layout_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Z?.]+(:[A-Z?.]+)?$").expect("layout pattern is a valid regex")
    })
}

/// Normalize a layout string (`nchw`, `NHWC:NCHW`) or reject it.
pub fn normalize_layout(text: &str) -> Result<String, String> {
    let upper = text.trim().to_ascii_uppercase();
    if layout_pattern().is_match(&upper) {
        Ok(upper)
    } else {
        Err(format!("invalid layout: {}", text))
    }
}

/// Sub-parameters of a stateful (sequence) model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatefulParams {
    pub max_sequence_number: u32,
    pub low_latency_transformation: bool,
    pub idle_sequence_cleanup: bool,
}

impl Default for StatefulParams {
    fn default() -> Self {
        Self {
            max_sequence_number: 500,
            low_latency_transformation: false,
            idle_sequence_cleanup: true,
        }
    }
}

/// Everything that determines how one version is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionConfig {
    /// Directory holding numbered version subdirectories.
    pub base_path: PathBuf,
    pub target_device: String,
    pub batch_size: Option<BatchSize>,
    /// Per-input shape policy, keyed by input name (`ANONYMOUS_INPUT` for all).
    pub shapes: BTreeMap<String, ShapePolicy>,
    /// Max concurrent inference streams; 0 lets the backend decide.
    pub nireq: u32,
    pub plugin_config: BTreeMap<String, String>,
    /// Layout applied to every input unless overridden in `layouts`.
    pub layout: Option<String>,
    pub layouts: BTreeMap<String, String>,
    /// `Some` for stateful models.
    pub stateful: Option<StatefulParams>,
}

impl VersionConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            target_device: DEFAULT_TARGET_DEVICE.to_string(),
            batch_size: None,
            shapes: BTreeMap::new(),
            nireq: 0,
            plugin_config: BTreeMap::new(),
            layout: None,
            layouts: BTreeMap::new(),
            stateful: None,
        }
    }

    pub fn is_stateful(&self) -> bool {
        self.stateful.is_some()
    }

    /// True if any batching or shape parameter is resolved per request.
    pub fn is_dynamic(&self) -> bool {
        self.batch_size == Some(BatchSize::Auto) || self.shapes.values().any(|s| s.is_dynamic())
    }

    /// Name of the first reload-significant field that differs, if any.
    pub fn reload_reason(&self, other: &VersionConfig) -> Option<&'static str> {
        if self.base_path != other.base_path {
            return Some("base_path");
        }
        if self.target_device != other.target_device {
            return Some("target_device");
        }
        if self.batch_size != other.batch_size {
            return Some("batch_size");
        }
        if self.shapes != other.shapes {
            return Some("shape");
        }
        if self.nireq != other.nireq {
            return Some("nireq");
        }
        if self.plugin_config != other.plugin_config {
            return Some("plugin_config");
        }
        if self.layout != other.layout || self.layouts != other.layouts {
            return Some("layout");
        }
        match (&self.stateful, &other.stateful) {
            (Some(a), Some(b)) if a != b => Some("stateful_parameters"),
            _ => None,
        }
    }

    pub fn is_reload_required(&self, other: &VersionConfig) -> bool {
        self.reload_reason(other).is_some()
    }
}

/// Desired configuration of one served model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelConfig {
    pub name: String,
    pub version_policy: VersionPolicy,
    pub version: VersionConfig,
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            version_policy: VersionPolicy::default(),
            version: VersionConfig::new(base_path),
        }
    }

    pub fn with_policy(mut self, policy: VersionPolicy) -> Self {
        self.version_policy = policy;
        self
    }
}
