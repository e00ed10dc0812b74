//! Lifecycle metrics via the `metrics` facade.
//!
//! The library only records; installing an exporter is up to the embedding
//! process.

use std::time::Duration;

use ::metrics::{counter, gauge, histogram};

use crate::models::{ErrorCode, VersionState};

const STATES: [VersionState; 5] = [
    VersionState::Start,
    VersionState::Loading,
    VersionState::Available,
    VersionState::Unloading,
    VersionState::End,
];

/// Register every series at zero so they show up before the first event.
pub fn init_metrics() {
    counter!("modelvisor_loads_started_total").absolute(0);
    counter!("modelvisor_loads_succeeded_total").absolute(0);
    counter!("modelvisor_loads_failed_total").absolute(0);
    counter!("modelvisor_teardowns_total").absolute(0);
    counter!("modelvisor_request_errors_total").absolute(0);
    counter!("modelvisor_config_rejected_total").absolute(0);
}

pub fn record_load_started(model: &str) {
    counter!("modelvisor_loads_started_total", "model" => model.to_string()).increment(1);
}

pub fn record_load_succeeded(model: &str, elapsed: Duration) {
    counter!("modelvisor_loads_succeeded_total", "model" => model.to_string()).increment(1);
    histogram!("modelvisor_load_duration_seconds", "model" => model.to_string()).record(elapsed.as_secs_f64());
}

pub fn record_load_failed(model: &str, code: ErrorCode) {
    counter!(
        "modelvisor_loads_failed_total",
        "model" => model.to_string(),
        "code" => code.as_str()
    )
    .increment(1);
}

pub fn record_teardown(model: &str) {
    counter!("modelvisor_teardowns_total", "model" => model.to_string()).increment(1);
}

pub fn record_request_error(kind: &'static str) {
    counter!("modelvisor_request_errors_total", "kind" => kind).increment(1);
}

pub fn record_config_rejected() {
    counter!("modelvisor_config_rejected_total").increment(1);
}

/// Versions of one model per lifecycle state, indexed in state order.
pub fn record_version_states(model: &str, counts: &[usize; 5]) {
    for (state, count) in STATES.iter().zip(counts) {
        gauge!(
            "modelvisor_versions",
            "model" => model.to_string(),
            "state" => state.as_str()
        )
        .set(*count as f64);
    }
}
