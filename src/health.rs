//! Health check support.
//!
//! Provides liveness, readiness, and full health report capabilities
//! for orchestrator integration (Kubernetes, systemd).

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::models::{Manager, VersionState};

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Detailed health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub ready: bool,
    pub accepting_requests: bool,
    /// Models in the served configuration.
    pub models_configured: usize,
    /// Configured models with a default version.
    pub models_ready: usize,
    pub versions_available: usize,
    /// Versions whose last load failed.
    pub versions_failed: usize,
    pub uptime_secs: u64,
}

/// Health check configuration.
#[derive(Debug, Clone, Default)]
pub struct HealthConfig {
    /// Only report ready once every configured model has a default version.
    pub require_all_models: bool,
}

/// Aggregates health information from the manager.
pub struct HealthChecker {
    config: HealthConfig,
    start_time: Instant,
}

struct Counts {
    configured: usize,
    ready: usize,
    available: usize,
    failed: usize,
}

impl HealthChecker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            start_time: Instant::now(),
        }
    }

    /// Check liveness: process is responsive.
    pub fn is_alive(&self) -> bool {
        true
    }

    /// Check readiness: accepting traffic.
    pub fn is_ready(&self, manager: &Manager) -> bool {
        if !manager.is_running() {
            return false;
        }
        let counts = Self::count(manager);
        !(self.config.require_all_models && counts.ready < counts.configured)
    }

    /// Generate full health report.
    pub fn report(&self, manager: &Manager) -> HealthReport {
        let accepting = manager.is_running();
        let counts = Self::count(manager);
        let ready = accepting && !(self.config.require_all_models && counts.ready < counts.configured);

        let state = if !accepting {
            HealthState::Unhealthy
        } else if counts.failed > 0 || counts.ready < counts.configured {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        HealthReport {
            state,
            ready,
            accepting_requests: accepting,
            models_configured: counts.configured,
            models_ready: counts.ready,
            versions_available: counts.available,
            versions_failed: counts.failed,
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    fn count(manager: &Manager) -> Counts {
        let configured = manager.served_models();
        let ready = configured
            .iter()
            .filter(|m| manager.default_version(&m.name).is_some())
            .count();

        let mut available = 0;
        let mut failed = 0;
        for reports in manager.all_statuses().values() {
            for report in reports {
                match (report.state, report.error_code) {
                    (VersionState::Available, _) => available += 1,
                    (VersionState::Loading, Some(_)) => failed += 1,
                    _ => {}
                }
            }
        }

        Counts { configured: configured.len(), ready, available, failed }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}
