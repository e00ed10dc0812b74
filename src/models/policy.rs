//! Version selection policy: which on-disk versions a model serves.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Selects the requested subset of the versions found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionPolicy {
    /// Serve every version directory.
    All,
    /// Serve the `num_versions` highest versions.
    Latest { num_versions: usize },
    /// Serve only the listed versions that also exist on disk.
    Specific { versions: BTreeSet<u64> },
}

impl VersionPolicy {
    pub fn filter(&self, available: &[u64]) -> BTreeSet<u64> {
        let available: BTreeSet<u64> = available.iter().copied().collect();
        match self {
            VersionPolicy::All => available,
            VersionPolicy::Latest { num_versions } => {
                available.into_iter().rev().take(*num_versions).collect()
            }
            VersionPolicy::Specific { versions } => {
                available.intersection(versions).copied().collect()
            }
        }
    }
}

impl Default for VersionPolicy {
    fn default() -> Self {
        VersionPolicy::Latest { num_versions: 1 }
    }
}

impl fmt::Display for VersionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionPolicy::All => write!(f, "all"),
            VersionPolicy::Latest { num_versions } => write!(f, "latest({})", num_versions),
            VersionPolicy::Specific { versions } => {
                let list: Vec<String> = versions.iter().map(|v| v.to_string()).collect();
                write!(f, "specific({})", list.join(","))
            }
        }
    }
}
