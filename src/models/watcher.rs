//! Periodic configuration and filesystem watcher.
//!
//! Every tick the watcher hashes the configuration file. A changed digest
//! reloads the file; otherwise the served configuration is reconciled again so
//! version directories added or removed on disk are picked up.

use std::sync::Weak;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::manager::Manager;

/// Hex SHA-256 of a configuration file's contents.
pub fn config_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// What one watcher pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The file changed and was applied.
    ConfigReloaded,
    /// The file changed but was rejected; the previous configuration stays.
    ConfigRejected,
    /// Nothing changed in the file; versions were rescanned.
    Rescanned,
}

/// Run one watcher pass. `last_seen` is the digest of the last file attempted.
pub async fn watch_once(manager: &Manager, last_seen: &mut Option<String>) -> WatchOutcome {
    if let Some(path) = manager.config_source() {
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let digest = config_digest(&bytes);
                if last_seen.as_deref() != Some(digest.as_str()) {
                    tracing::info!(path = %path.display(), digest = %digest, "configuration file changed");
                    *last_seen = Some(digest);
                    return match manager.load_configuration(&path).await {
                        Ok(_) => WatchOutcome::ConfigReloaded,
                        Err(_) => WatchOutcome::ConfigRejected,
                    };
                }
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "configuration file unreadable, keeping current configuration");
            }
        }
    }

    manager.reconcile_all().await;
    WatchOutcome::Rescanned
}

/// Spawn the watcher task. It stops on cancellation or once the manager is dropped.
pub(crate) fn spawn(manager: Weak<Manager>, period: Duration, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_seen = manager.upgrade().and_then(|m| m.applied_digest());
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately
        ticker.tick().await;
        tracing::info!(interval_ms = period.as_millis() as u64, "config watcher started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(manager) = manager.upgrade() else {
                break;
            };
            watch_once(&manager, &mut last_seen).await;
        }

        tracing::info!("config watcher stopped");
    })
}
