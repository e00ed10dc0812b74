//! Process-wide model registry.
//!
//! The `Manager` owns one `ModelEntry` per configured model name, the cached
//! desired configuration, and the watcher that keeps the two in sync. Request
//! handlers only ever call `get_instance` (or `with_instance`) and hold the
//! returned guard for the duration of their inference call.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backend::ModelBackend;
use super::config_file::{ConfigDocument, ConfigError};
use super::guard::UnloadGuard;
use super::instance::InstanceHandle;
use super::loader::{ScanError, VersionScanner};
use super::model_config::ModelConfig;
use super::reconcile::{reconcile, ReconcileError, VersionChanges};
use super::registry::{ModelEntry, VersionStatusReport};
use super::status::VersionState;
use super::watcher;
use crate::telemetry::{self, ReconcileSpan, SpanExt};

/// Request-time failures, returned to the caller as values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Model with requested name is not found: {0}")]
    ModelNameMissing(String),

    #[error("Model {model} has no version {}", .version.map(|v| v.to_string()).unwrap_or_else(|| "available by default".to_string()))]
    ModelVersionMissing { model: String, version: Option<u64> },

    #[error("Model {model} version {version} is not loaded yet")]
    ModelVersionNotLoadedYet { model: String, version: u64 },

    #[error("Model {model} version {version} is no longer loaded")]
    ModelVersionNotLoadedAnymore { model: String, version: u64 },
}

impl RequestError {
    /// Stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestError::ModelNameMissing(_) => "model_name_missing",
            RequestError::ModelVersionMissing { .. } => "model_version_missing",
            RequestError::ModelVersionNotLoadedYet { .. } => "model_version_not_loaded_yet",
            RequestError::ModelVersionNotLoadedAnymore { .. } => "model_version_not_loaded_anymore",
        }
    }
}

/// Which version of a model a request wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionSelector {
    /// Highest available version.
    #[default]
    Default,
    Specific(u64),
}

impl From<Option<u64>> for VersionSelector {
    fn from(version: Option<u64>) -> Self {
        match version {
            Some(v) => VersionSelector::Specific(v),
            None => VersionSelector::Default,
        }
    }
}

/// Manager tuning.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long `get_instance` waits on a loading version.
    pub load_wait: Duration,
    /// Watcher period; `None` disables the watcher.
    pub watch_interval: Option<Duration>,
    /// If set, model base paths must resolve inside this directory.
    pub model_root: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            load_wait: Duration::from_millis(500),
            watch_interval: Some(Duration::from_secs(1)),
            model_root: None,
        }
    }
}

/// Outcome of one reconciliation pass over every configured model.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub changes: BTreeMap<String, VersionChanges>,
    pub failures: BTreeMap<String, ReconcileError>,
    /// Models dropped from the configuration whose versions were retired.
    pub retired_models: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Default)]
struct ServedConfig {
    source: Option<PathBuf>,
    digest: Option<String>,
    models: Vec<ModelConfig>,
}

/// Registry of every served model.
pub struct Manager {
    config: ManagerConfig,
    backend: Arc<dyn ModelBackend>,
    scanner: VersionScanner,
    models: DashMap<String, Arc<ModelEntry>>,
    served: RwLock<ServedConfig>,
    /// Serializes reconciliation passes.
    reconcile_lock: tokio::sync::Mutex<()>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Manager {
    pub fn new(config: ManagerConfig, backend: Arc<dyn ModelBackend>) -> Arc<Self> {
        let scanner = match &config.model_root {
            Some(root) => VersionScanner::with_model_root(root.clone()),
            None => VersionScanner::new(),
        };
        Arc::new(Self {
            config,
            backend,
            scanner,
            models: DashMap::new(),
            served: RwLock::new(ServedConfig::default()),
            reconcile_lock: tokio::sync::Mutex::new(()),
            watcher: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// False once `shutdown` was called.
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Parse and apply a configuration file.
    ///
    /// A rejected file leaves the served configuration untouched.
    pub async fn load_configuration(&self, path: &Path) -> Result<ReconcileReport, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let root = path.parent().unwrap_or_else(|| Path::new("."));

        let document = match ConfigDocument::parse(&text, root) {
            Ok(document) => document,
            Err(e) => {
                telemetry::record_config_rejected();
                tracing::error!(path = %path.display(), error = %e, "configuration rejected");
                return Err(e);
            }
        };

        tracing::info!(
            path = %path.display(),
            models = document.models.len(),
            "configuration loaded"
        );
        {
            let mut served = self.served.write();
            served.source = Some(path.to_path_buf());
            served.digest = Some(watcher::config_digest(text.as_bytes()));
            served.models = document.models;
        }
        Ok(self.reconcile_all().await)
    }

    /// Replace the desired configuration with an already validated document.
    pub async fn apply_document(&self, document: ConfigDocument) -> ReconcileReport {
        self.served.write().models = document.models;
        self.reconcile_all().await
    }

    /// Serve exactly one model without a configuration file.
    pub async fn serve_single_model(&self, model: ModelConfig) -> ReconcileReport {
        tracing::info!(model = %model.name, path = %model.version.base_path.display(), "serving single model");
        {
            let mut served = self.served.write();
            served.source = None;
            served.digest = None;
            served.models = vec![model];
        }
        self.reconcile_all().await
    }

    /// Rescan every configured model and apply the differences.
    pub async fn reconcile_all(&self) -> ReconcileReport {
        let _pass = self.reconcile_lock.lock().await;
        let desired = self.served.read().models.clone();
        let mut report = ReconcileReport::default();

        for model in &desired {
            let available = self.scan_versions(&model.version.base_path).await;
            match self.reconcile_model(model, available) {
                Ok(changes) => {
                    report.changes.insert(model.name.clone(), changes);
                }
                Err(e) => {
                    report.failures.insert(model.name.clone(), e);
                }
            }
        }

        let wanted: HashSet<&str> = desired.iter().map(|m| m.name.as_str()).collect();
        let removed: Vec<Arc<ModelEntry>> = self
            .models
            .iter()
            .filter(|e| !wanted.contains(e.key().as_str()))
            .map(|e| e.value().clone())
            .collect();
        for entry in removed {
            let live = entry.version_snapshots().values().any(|s| s.state.is_live());
            if live {
                tracing::info!(model = %entry.name(), "model removed from configuration, retiring all versions");
                entry.retire_all();
                report.retired_models.push(entry.name().to_string());
            }
        }

        report
    }

    /// Directory listing runs on a blocking worker, like loads do.
    async fn scan_versions(&self, base_path: &Path) -> Result<Vec<u64>, ScanError> {
        let scanner = self.scanner.clone();
        let base_path = base_path.to_path_buf();
        tokio::task::spawn_blocking(move || scanner.read_available_versions(&base_path))
            .await
            .map_err(|e| ScanError::Io(std::io::Error::other(e)))?
    }

    fn reconcile_model(
        &self,
        model: &ModelConfig,
        available: Result<Vec<u64>, ScanError>,
    ) -> Result<VersionChanges, ReconcileError> {
        let span = ReconcileSpan::new(&model.name);
        let _enter = span.enter();

        let entry = self
            .models
            .entry(model.name.clone())
            .or_insert_with(|| ModelEntry::new(&model.name, self.backend.clone()))
            .clone();

        let result = available
            .map_err(ReconcileError::from)
            .and_then(|available| {
                let requested = model.version_policy.filter(&available);
                let desired = Arc::new(model.version.clone());
                let changes = reconcile(&model.name, &desired, &entry.version_snapshots(), &requested)?;
                entry.apply(&changes, &desired);
                Ok(changes)
            });

        span.record_result(&result);
        match &result {
            Ok(changes) if !changes.is_empty() => {
                span.record("to_start", changes.to_start.len() as u64);
                span.record("to_reload", changes.to_reload.len() as u64);
                span.record("to_retire", changes.to_retire.len() as u64);
                tracing::info!(
                    model = %model.name,
                    policy = %model.version_policy,
                    start = ?changes.to_start,
                    reload = ?changes.to_reload,
                    retire = ?changes.to_retire,
                    "versions reconciled"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(model = %model.name, error = %e, "reconciliation failed");
            }
        }
        result
    }

    /// Resolve and pin a version for one request.
    pub async fn get_instance(
        &self,
        name: &str,
        selector: VersionSelector,
    ) -> Result<UnloadGuard, RequestError> {
        let result = self.resolve(name, selector).await;
        if let Err(e) = &result {
            telemetry::record_request_error(e.kind());
            tracing::debug!(model = name, ?selector, error = %e, "instance request refused");
        }
        result
    }

    /// Run `f` against a pinned version; the pin is released on return.
    pub async fn with_instance<F, R>(
        &self,
        name: &str,
        selector: VersionSelector,
        f: F,
    ) -> Result<R, RequestError>
    where
        F: FnOnce(&InstanceHandle) -> R,
    {
        let guard = self.get_instance(name, selector).await?;
        Ok(f(&guard))
    }

    async fn resolve(&self, name: &str, selector: VersionSelector) -> Result<UnloadGuard, RequestError> {
        let entry = self
            .entry(name)
            .ok_or_else(|| RequestError::ModelNameMissing(name.to_string()))?;

        // A reload swap can land between lookup and pin; look up once more.
        let mut retried = false;
        loop {
            let version = match selector {
                VersionSelector::Specific(v) => v,
                VersionSelector::Default => entry.default_version().ok_or_else(|| {
                    RequestError::ModelVersionMissing { model: name.to_string(), version: None }
                })?,
            };
            let handle = entry.get(version).ok_or_else(|| RequestError::ModelVersionMissing {
                model: name.to_string(),
                version: match selector {
                    VersionSelector::Default => None,
                    VersionSelector::Specific(v) => Some(v),
                },
            })?;

            match self.acquire(name, version, &handle).await {
                Err(RequestError::ModelVersionNotLoadedAnymore { .. })
                    if !retried && Self::superseded(&entry, selector, version, &handle) =>
                {
                    retried = true;
                }
                result => return result,
            }
        }
    }

    async fn acquire(
        &self,
        name: &str,
        version: u64,
        handle: &Arc<InstanceHandle>,
    ) -> Result<UnloadGuard, RequestError> {
        let not_yet = || RequestError::ModelVersionNotLoadedYet { model: name.to_string(), version };
        let anymore = || RequestError::ModelVersionNotLoadedAnymore { model: name.to_string(), version };

        match handle.state() {
            VersionState::Available => {}
            VersionState::Unloading | VersionState::End => return Err(anymore()),
            VersionState::Start | VersionState::Loading => {
                match handle.status().wait_settled(self.config.load_wait).await {
                    Some(snap) if snap.is_available() => {}
                    Some(snap) if matches!(snap.state, VersionState::Unloading | VersionState::End) => {
                        return Err(anymore())
                    }
                    _ => return Err(not_yet()),
                }
            }
        }

        handle.pin().map_err(|_| anymore())
    }

    /// True if the slot (or the default) moved on since `handle` was looked up.
    fn superseded(
        entry: &ModelEntry,
        selector: VersionSelector,
        version: u64,
        handle: &Arc<InstanceHandle>,
    ) -> bool {
        if selector == VersionSelector::Default && entry.default_version() != Some(version) {
            return true;
        }
        entry.get(version).is_some_and(|current| !Arc::ptr_eq(&current, handle))
    }

    /// Status records for one model, optionally narrowed to one version.
    pub fn model_status(
        &self,
        name: &str,
        version: Option<u64>,
    ) -> Result<Vec<VersionStatusReport>, RequestError> {
        let entry = self
            .entry(name)
            .ok_or_else(|| RequestError::ModelNameMissing(name.to_string()))?;
        let reports = entry.status_reports();
        match version {
            None => Ok(reports),
            Some(v) => {
                let matching: Vec<_> = reports.into_iter().filter(|r| r.version == v).collect();
                if matching.is_empty() {
                    return Err(RequestError::ModelVersionMissing { model: name.to_string(), version: Some(v) });
                }
                Ok(matching)
            }
        }
    }

    /// Status records of every model the manager has seen.
    pub fn all_statuses(&self) -> BTreeMap<String, Vec<VersionStatusReport>> {
        self.models
            .iter()
            .map(|e| (e.key().clone(), e.value().status_reports()))
            .collect()
    }

    pub fn default_version(&self, name: &str) -> Option<u64> {
        self.entry(name).and_then(|e| e.default_version())
    }

    pub fn entry(&self, name: &str) -> Option<Arc<ModelEntry>> {
        self.models.get(name).map(|e| e.value().clone())
    }

    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Desired configuration currently being served.
    pub fn served_models(&self) -> Vec<ModelConfig> {
        self.served.read().models.clone()
    }

    pub fn config_source(&self) -> Option<PathBuf> {
        self.served.read().source.clone()
    }

    /// Digest of the last configuration file that was applied.
    pub fn applied_digest(&self) -> Option<String> {
        self.served.read().digest.clone()
    }

    /// Wait for in-flight loads, reload swaps and unpinned teardowns.
    ///
    /// Returns false if `timeout` elapsed first.
    pub async fn wait_for_settled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let entries: Vec<Arc<ModelEntry>> = self.models.iter().map(|e| e.value().clone()).collect();

        for entry in &entries {
            if !entry.wait_idle(deadline.saturating_duration_since(Instant::now())).await {
                return false;
            }
        }
        for entry in &entries {
            for handle in entry.handles() {
                if handle.state() == VersionState::Unloading && handle.ref_count() == 0 {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if !handle.status().wait_for_state(VersionState::End, remaining).await {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Start the periodic watcher. No-op if disabled or already running.
    pub fn start_watcher(self: &Arc<Self>) -> bool {
        let Some(interval) = self.config.watch_interval else {
            tracing::info!("config watcher disabled");
            return false;
        };
        let mut slot = self.watcher.lock();
        if slot.is_some() || !self.is_running() {
            return false;
        }
        *slot = Some(watcher::spawn(Arc::downgrade(self), interval, self.shutdown.child_token()));
        true
    }

    /// Stop the watcher and retire every version of every model.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        for entry in self.models.iter() {
            entry.value().retire_all();
        }
        tracing::info!(models = self.models.len(), "manager shut down");
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .field("models", &self.model_names())
            .field("running", &self.is_running())
            .finish()
    }
}
