//! modelvisor
//!
//! Keeps a fleet of versioned models loaded, warm and safely swappable while
//! requests keep flowing.
//!
//! # Overview
//!
//! - [`models::Manager`] owns one registry entry per configured model and
//!   reconciles it against a desired configuration (a JSON document or a
//!   single model given on the command line).
//! - Reconciliation decides per version whether to start, reload or retire
//!   it; loads and teardowns run on blocking workers, never under a lock.
//! - Request handlers call [`models::Manager::get_instance`] and hold the
//!   returned [`models::UnloadGuard`] while they use the model. A retired
//!   version keeps its resources until the last guard is dropped.
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use modelvisor::models::{Manager, ManagerConfig, MmapBackend, VersionSelector};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = Manager::new(ManagerConfig::default(), Arc::new(MmapBackend::new()));
//! manager.load_configuration(Path::new("config.json")).await?;
//! manager.start_watcher();
//!
//! let guard = manager.get_instance("resnet", VersionSelector::Default).await?;
//! println!("serving resnet version {}", guard.version());
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod health;
pub mod models;
pub mod telemetry;
