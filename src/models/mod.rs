//! Model version lifecycle management.
//!
//! Keeps every configured model's versions loaded, reconciles them against
//! the desired configuration and hands out pinned instances to requests.

mod backend;
mod config_file;
mod guard;
mod instance;
mod loader;
mod manager;
mod model_config;
mod policy;
mod reconcile;
mod registry;
mod status;
pub mod watcher;

pub use backend::{LoadError, LoadRequest, LoadedModel, MappedModel, MappedVersion, MmapBackend, ModelBackend};
pub use config_file::{ConfigDocument, ConfigError};
pub use guard::UnloadGuard;
pub use instance::{InstanceHandle, PinError};
pub use loader::{version_path, ScanError, VersionScanner};
pub use manager::{Manager, ManagerConfig, ReconcileReport, RequestError, VersionSelector};
pub use model_config::{
    normalize_layout, BatchSize, Dimension, ModelConfig, ShapePolicy, StatefulParams, VersionConfig,
    ANONYMOUS_INPUT, DEFAULT_TARGET_DEVICE,
};
pub use policy::VersionPolicy;
pub use reconcile::{reconcile, ReconcileError, VersionChanges, VersionSnapshot};
pub use registry::{ModelEntry, VersionStatusReport};
pub use status::{ErrorCode, StatusSnapshot, TransitionError, VersionState, VersionStatus};
pub use watcher::{config_digest, WatchOutcome};
