//! A single loadable model version.
//!
//! An `InstanceHandle` binds one immutable `VersionConfig` to backend
//! resources and a `VersionStatus`. Handles are never reconfigured: a changed
//! configuration always produces a new handle. Retirement is split in two:
//! marking the handle `Unloading` is immediate, while releasing resources waits
//! until the last `UnloadGuard` is dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use super::backend::{LoadError, LoadRequest, LoadedModel, ModelBackend};
use super::guard::UnloadGuard;
use super::loader::version_path;
use super::model_config::VersionConfig;
use super::status::{RetireStep, StatusSnapshot, TransitionError, VersionState, VersionStatus};
use crate::telemetry;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PinError {
    #[error("Model {model} version {version} is no longer loaded")]
    Retired { model: String, version: u64 },
}

#[derive(Debug, Default)]
struct Pins {
    count: usize,
    retiring: bool,
    teardown_started: bool,
}

/// One version of one model, from creation to teardown.
pub struct InstanceHandle {
    model_name: String,
    version: u64,
    config: Arc<VersionConfig>,
    status: VersionStatus,
    backend: Arc<dyn ModelBackend>,
    model: RwLock<Option<Arc<dyn LoadedModel>>>,
    pins: Mutex<Pins>,
}

impl InstanceHandle {
    pub fn new(
        model_name: impl Into<String>,
        version: u64,
        config: Arc<VersionConfig>,
        backend: Arc<dyn ModelBackend>,
    ) -> Arc<Self> {
        Arc::new(Self {
            model_name: model_name.into(),
            version,
            config,
            status: VersionStatus::new(),
            backend,
            model: RwLock::new(None),
            pins: Mutex::new(Pins::default()),
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn config(&self) -> &VersionConfig {
        &self.config
    }

    pub(crate) fn shared_config(&self) -> Arc<VersionConfig> {
        self.config.clone()
    }

    pub fn status(&self) -> &VersionStatus {
        &self.status
    }

    pub fn state(&self) -> VersionState {
        self.status.state()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    /// Number of outstanding pins.
    pub fn ref_count(&self) -> usize {
        self.pins.lock().count
    }

    /// Backend resources, present between a successful load and teardown.
    pub fn loaded_model(&self) -> Option<Arc<dyn LoadedModel>> {
        self.model.read().clone()
    }

    /// Load the version through the backend. Blocks; run it on a worker.
    ///
    /// On failure the status stays `Loading` with the error's code.
    pub fn load(&self) -> Result<(), LoadError> {
        if let Err(e) = self.status.set_loading() {
            // Retired before the worker got to it
            tracing::debug!(model = %self.model_name, version = self.version, error = %e, "load skipped");
            return Ok(());
        }

        let started = Instant::now();
        telemetry::record_load_started(&self.model_name);
        let path = version_path(&self.config.base_path, self.version);
        let request = LoadRequest {
            model_name: &self.model_name,
            version: self.version,
            version_path: &path,
            config: &self.config,
        };

        match self.backend.load(&request) {
            Ok(model) => {
                *self.model.write() = Some(Arc::from(model));
                match self.status.set_available() {
                    Ok(()) => {
                        telemetry::record_load_succeeded(&self.model_name, started.elapsed());
                        tracing::info!(
                            model = %self.model_name,
                            version = self.version,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "model version available"
                        );
                    }
                    Err(TransitionError::RetiredWhileLoading) => {
                        tracing::info!(
                            model = %self.model_name,
                            version = self.version,
                            "model version retired while loading"
                        );
                        if self.mark_retiring() {
                            self.teardown();
                        }
                    }
                    Err(e) => {
                        tracing::warn!(model = %self.model_name, version = self.version, error = %e, "unexpected state after load");
                    }
                }
                Ok(())
            }
            Err(err) => {
                let _ = self.status.set_load_failed(err.code());
                telemetry::record_load_failed(&self.model_name, err.code());
                tracing::error!(
                    model = %self.model_name,
                    version = self.version,
                    error = %err,
                    "model version failed to load"
                );
                if self.status.is_retire_pending() {
                    let _ = self.status.set_end();
                }
                Err(err)
            }
        }
    }

    /// Stop routing to this version and release it once unpinned.
    pub fn unload(self: &Arc<Self>) {
        match self.status.begin_retire() {
            RetireStep::Ended => {
                tracing::info!(model = %self.model_name, version = self.version, "model version retired before loading");
            }
            RetireStep::Deferred => {
                tracing::debug!(model = %self.model_name, version = self.version, "retirement deferred to load worker");
            }
            RetireStep::Unloading => {
                tracing::info!(
                    model = %self.model_name,
                    version = self.version,
                    pins = self.ref_count(),
                    "model version unloading"
                );
                if self.mark_retiring() {
                    self.spawn_teardown();
                }
            }
            RetireStep::AlreadyRetiring => {}
        }
    }

    /// Take a pin that defers teardown until the guard is dropped.
    pub fn pin(self: &Arc<Self>) -> Result<UnloadGuard, PinError> {
        {
            let mut pins = self.pins.lock();
            if pins.teardown_started || self.status.state() == VersionState::End {
                return Err(PinError::Retired {
                    model: self.model_name.clone(),
                    version: self.version,
                });
            }
            pins.count += 1;
        }
        Ok(UnloadGuard::new(self.clone()))
    }

    pub(crate) fn release_pin(self: &Arc<Self>) {
        let start_teardown = {
            let mut pins = self.pins.lock();
            pins.count = pins.count.saturating_sub(1);
            if pins.count == 0 && pins.retiring && !pins.teardown_started {
                pins.teardown_started = true;
                true
            } else {
                false
            }
        };
        if start_teardown {
            self.spawn_teardown();
        }
    }

    /// Flag the handle for teardown; true if the caller must run it now.
    fn mark_retiring(&self) -> bool {
        let mut pins = self.pins.lock();
        pins.retiring = true;
        if pins.count == 0 && !pins.teardown_started {
            pins.teardown_started = true;
            true
        } else {
            false
        }
    }

    fn spawn_teardown(self: &Arc<Self>) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let this = self.clone();
                runtime.spawn_blocking(move || this.teardown());
            }
            Err(_) => self.teardown(),
        }
    }

    fn teardown(&self) {
        let model = self.model.write().take();
        let freed = model.as_ref().map(|m| m.memory_bytes()).unwrap_or(0);
        if let Some(model) = model {
            model.unload();
        }
        match self.status.set_end() {
            Ok(()) => {
                telemetry::record_teardown(&self.model_name);
                tracing::info!(
                    model = %self.model_name,
                    version = self.version,
                    freed_bytes = freed,
                    "model version unloaded"
                );
            }
            Err(e) => {
                tracing::warn!(model = %self.model_name, version = self.version, error = %e, "teardown in unexpected state");
            }
        }
    }
}

impl fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("model_name", &self.model_name)
            .field("version", &self.version)
            .field("state", &self.status.state())
            .field("error_code", &self.status.error_code())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
