//! Structured logging, tracing spans and metrics.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use self::metrics::{
    init_metrics, record_config_rejected, record_load_failed, record_load_started,
    record_load_succeeded, record_request_error, record_teardown, record_version_states,
};
pub use spans::{ReconcileSpan, SpanExt};
