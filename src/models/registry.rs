//! Per-model version registry.
//!
//! A `ModelEntry` owns the map version -> instance for one model name. The map
//! lock is only held to publish or look up handles; loads and teardowns run on
//! blocking workers outside it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use super::backend::ModelBackend;
use super::instance::InstanceHandle;
use super::model_config::VersionConfig;
use super::reconcile::{VersionChanges, VersionSnapshot};
use super::status::{ErrorCode, VersionState};
use crate::telemetry;

/// Status record of one version, as served to status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionStatusReport {
    pub name: String,
    pub version: u64,
    pub state: VersionState,
    pub error_code: Option<ErrorCode>,
}

/// Handles registered under one version number.
struct Slot {
    current: Arc<InstanceHandle>,
    /// Replacement being loaded; swapped into `current` once it settles.
    pending: Option<Arc<InstanceHandle>>,
}

impl Slot {
    /// The handle whose state describes this version.
    fn effective(&self) -> &Arc<InstanceHandle> {
        self.pending.as_ref().unwrap_or(&self.current)
    }

    /// The handle requests for this version should go to.
    fn routable(&self) -> &Arc<InstanceHandle> {
        match &self.pending {
            Some(pending) if self.current.state() != VersionState::Available => pending,
            _ => &self.current,
        }
    }
}

/// All versions of one model.
pub struct ModelEntry {
    name: String,
    backend: Arc<dyn ModelBackend>,
    versions: RwLock<BTreeMap<u64, Slot>>,
    default_version: RwLock<Option<u64>>,
    /// Outstanding background loads, including their reload swap.
    jobs: watch::Sender<usize>,
}

/// Decrements the entry's job count when the blocking job finishes.
struct JobGuard {
    entry: Arc<ModelEntry>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.entry.jobs.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl ModelEntry {
    pub fn new(name: impl Into<String>, backend: Arc<dyn ModelBackend>) -> Arc<Self> {
        let (jobs, _rx) = watch::channel(0);
        Arc::new(Self {
            name: name.into(),
            backend,
            versions: RwLock::new(BTreeMap::new()),
            default_version: RwLock::new(None),
            jobs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Highest `Available` version as of the last mutation.
    pub fn default_version(&self) -> Option<u64> {
        *self.default_version.read()
    }

    /// Handle a request for `version` should use.
    pub fn get(&self, version: u64) -> Option<Arc<InstanceHandle>> {
        self.versions.read().get(&version).map(|slot| slot.routable().clone())
    }

    /// Every handle still referenced by the map, replacements included.
    pub fn handles(&self) -> Vec<Arc<InstanceHandle>> {
        let map = self.versions.read();
        map.values()
            .flat_map(|slot| std::iter::once(slot.current.clone()).chain(slot.pending.clone()))
            .collect()
    }

    /// Reconciler input: one snapshot per version number.
    pub fn version_snapshots(&self) -> BTreeMap<u64, VersionSnapshot> {
        let map = self.versions.read();
        map.iter()
            .map(|(&version, slot)| {
                let handle = slot.effective();
                let status = handle.snapshot();
                let snapshot = VersionSnapshot {
                    state: status.state,
                    error_code: status.error_code,
                    config: handle.shared_config(),
                };
                (version, snapshot)
            })
            .collect()
    }

    pub fn status_reports(&self) -> Vec<VersionStatusReport> {
        let map = self.versions.read();
        map.iter()
            .map(|(&version, slot)| {
                let snap = slot.routable().snapshot();
                VersionStatusReport {
                    name: self.name.clone(),
                    version,
                    state: snap.state,
                    error_code: snap.error_code,
                }
            })
            .collect()
    }

    /// Start, reload, then retire, in that order.
    pub fn apply(self: &Arc<Self>, changes: &VersionChanges, config: &Arc<VersionConfig>) {
        if !changes.to_start.is_empty() {
            self.add_versions(&changes.to_start, config);
        }
        if !changes.to_reload.is_empty() {
            self.reload_versions(&changes.to_reload, config);
        }
        if !changes.to_retire.is_empty() {
            self.retire_versions(&changes.to_retire);
        }
    }

    /// Publish a fresh handle per version and load each in the background.
    pub fn add_versions(self: &Arc<Self>, versions: &BTreeSet<u64>, config: &Arc<VersionConfig>) {
        for &version in versions {
            let handle = InstanceHandle::new(&self.name, version, config.clone(), self.backend.clone());
            let replaced = {
                let mut map = self.versions.write();
                map.insert(version, Slot { current: handle.clone(), pending: None })
            };
            if let Some(old) = replaced {
                tracing::warn!(model = %self.name, version, "start replaced an existing version");
                old.current.unload();
                if let Some(pending) = old.pending {
                    pending.unload();
                }
            }

            tracing::info!(model = %self.name, version, "starting model version");
            let entry = self.clone();
            self.spawn_job(move || {
                let _ = handle.load();
                entry.recompute_default_version();
            });
        }
        self.recompute_default_version();
    }

    /// Load replacements next to the live handles and swap once settled.
    pub fn reload_versions(self: &Arc<Self>, versions: &BTreeSet<u64>, config: &Arc<VersionConfig>) {
        for &version in versions {
            let replacement = InstanceHandle::new(&self.name, version, config.clone(), self.backend.clone());
            let superseded = {
                let mut map = self.versions.write();
                match map.get_mut(&version) {
                    Some(slot) => slot.pending.replace(replacement.clone()),
                    None => {
                        map.insert(version, Slot { current: replacement.clone(), pending: None });
                        None
                    }
                }
            };
            if let Some(superseded) = superseded {
                superseded.unload();
            }

            tracing::info!(model = %self.name, version, "reloading model version");
            let entry = self.clone();
            self.spawn_job(move || {
                let _ = replacement.load();
                entry.complete_reload(version, &replacement);
            });
        }
    }

    /// Ask every handle of the given versions to unload.
    ///
    /// Entries stay in the map so their status keeps resolving.
    pub fn retire_versions(&self, versions: &BTreeSet<u64>) {
        let handles: Vec<Arc<InstanceHandle>> = {
            let map = self.versions.read();
            versions
                .iter()
                .filter_map(|v| map.get(v))
                .flat_map(|slot| std::iter::once(slot.current.clone()).chain(slot.pending.clone()))
                .collect()
        };
        for handle in handles {
            tracing::info!(model = %self.name, version = handle.version(), "retiring model version");
            handle.unload();
        }
        self.recompute_default_version();
    }

    pub fn retire_all(&self) {
        let versions: BTreeSet<u64> = self.versions.read().keys().copied().collect();
        self.retire_versions(&versions);
    }

    /// Lock order: `default_version` before `versions`, so concurrent
    /// recomputes publish in the order they observed the map.
    pub fn recompute_default_version(&self) {
        let mut published = self.default_version.write();
        let (default, counts) = {
            let map = self.versions.read();
            let mut counts = [0usize; 5];
            let mut default = None;
            for (&version, slot) in map.iter() {
                let state = slot.routable().state();
                counts[state as usize] += 1;
                if state == VersionState::Available {
                    default = Some(version);
                }
            }
            (default, counts)
        };

        let previous = std::mem::replace(&mut *published, default);
        drop(published);
        if previous != default {
            tracing::debug!(model = %self.name, ?previous, ?default, "default version changed");
        }
        telemetry::record_version_states(&self.name, &counts);
    }

    /// Wait for background loads (and reload swaps) to finish. False on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.jobs.subscribe();
        let wait = rx.wait_for(|n| *n == 0);
        let idle = matches!(tokio::time::timeout(timeout, wait).await, Ok(Ok(_)));
        idle
    }

    fn complete_reload(&self, version: u64, replacement: &Arc<InstanceHandle>) {
        let (old, kept_pending) = {
            let mut map = self.versions.write();
            match map.get_mut(&version) {
                Some(slot) if slot.pending.as_ref().is_some_and(|p| Arc::ptr_eq(p, replacement)) => {
                    if replacement.state() == VersionState::Available {
                        slot.pending = None;
                        (Some(std::mem::replace(&mut slot.current, replacement.clone())), false)
                    } else {
                        // A failed replacement stays pending; `current` keeps serving
                        (None, true)
                    }
                }
                // Superseded by a later reload, or this was a fresh insert
                _ => (None, false),
            }
        };
        if let Some(old) = old {
            tracing::info!(model = %self.name, version, "model version replaced");
            old.unload();
        } else if kept_pending && replacement.status().error_code().is_some() {
            tracing::warn!(
                model = %self.name,
                version,
                state = %replacement.state(),
                error = ?replacement.status().error_code(),
                "replacement did not load, previous instance stays routable"
            );
        }
        self.recompute_default_version();
    }

    fn spawn_job<F>(self: &Arc<Self>, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.jobs.send_modify(|n| *n += 1);
        let guard = JobGuard { entry: self.clone() };
        let task = move || {
            let _guard = guard;
            job();
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(task);
            }
            Err(_) => task(),
        }
    }
}

impl std::fmt::Debug for ModelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let versions: Vec<u64> = self.versions.read().keys().copied().collect();
        f.debug_struct("ModelEntry")
            .field("name", &self.name)
            .field("versions", &versions)
            .field("default_version", &self.default_version())
            .finish()
    }
}
