//! Desired vs. actual version diff.
//!
//! `reconcile` is a pure function: it looks at a snapshot of the versions a
//! model currently has and the set the configuration asks for, and decides
//! which versions to start, reload and retire. Applying the result is the
//! registry entry's job.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;

use super::loader::ScanError;
use super::model_config::VersionConfig;
use super::status::{ErrorCode, VersionState};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Incompatible configuration change for model {model}: {reason}")]
    Incompatible { model: String, reason: String },

    #[error("Version scan failed: {0}")]
    Scan(#[from] ScanError),
}

/// What the reconciler needs to know about one current version.
#[derive(Debug, Clone)]
pub struct VersionSnapshot {
    pub state: VersionState,
    pub error_code: Option<ErrorCode>,
    pub config: Arc<VersionConfig>,
}

impl VersionSnapshot {
    fn is_load_failed(&self) -> bool {
        self.state == VersionState::Loading && self.error_code.is_some()
    }
}

/// Version sets produced by one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionChanges {
    pub to_start: BTreeSet<u64>,
    pub to_reload: BTreeSet<u64>,
    pub to_retire: BTreeSet<u64>,
}

impl VersionChanges {
    pub fn is_empty(&self) -> bool {
        self.to_start.is_empty() && self.to_reload.is_empty() && self.to_retire.is_empty()
    }
}

/// Reject desired configs that can never be applied to the current versions.
fn check_compatible(
    model: &str,
    desired: &VersionConfig,
    current: &BTreeMap<u64, VersionSnapshot>,
) -> Result<(), ReconcileError> {
    if desired.is_stateful() && desired.is_dynamic() {
        return Err(ReconcileError::Incompatible {
            model: model.to_string(),
            reason: "dynamic shape or automatic batch size on a stateful model".to_string(),
        });
    }

    let mismatch = current
        .iter()
        .find(|(_, snap)| snap.state.is_live() && snap.config.is_stateful() != desired.is_stateful());
    if let Some((version, snap)) = mismatch {
        let (from, to) = if snap.config.is_stateful() {
            ("stateful", "stateless")
        } else {
            ("stateless", "stateful")
        };
        return Err(ReconcileError::Incompatible {
            model: model.to_string(),
            reason: format!("version {version} is {from}, requested {to}"),
        });
    }
    Ok(())
}

/// Compute which versions to start, reload and retire.
///
/// Each version number is classified on its own. A failed load (`Loading`
/// with an error code) is only retried when the desired config differs from
/// the one it failed with.
pub fn reconcile(
    model: &str,
    desired: &VersionConfig,
    current: &BTreeMap<u64, VersionSnapshot>,
    requested: &BTreeSet<u64>,
) -> Result<VersionChanges, ReconcileError> {
    check_compatible(model, desired, current)?;

    let mut changes = VersionChanges::default();
    for &version in requested {
        let Some(snap) = current.get(&version) else {
            changes.to_start.insert(version);
            continue;
        };
        let reload = match snap.state {
            VersionState::Start => false,
            VersionState::Loading => snap.is_load_failed() && snap.config.is_reload_required(desired),
            VersionState::Available => snap.config.is_reload_required(desired),
            VersionState::Unloading | VersionState::End => true,
        };
        if reload {
            changes.to_reload.insert(version);
        }
    }

    for (&version, snap) in current {
        if !requested.contains(&version) && snap.state.is_live() {
            changes.to_retire.insert(version);
        }
    }

    Ok(changes)
}
