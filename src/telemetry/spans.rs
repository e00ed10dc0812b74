//! Span utilities and extension traits.

use tracing::{info_span, Span};

/// Extension trait for adding context to spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for the span wrapping one model's reconciliation.
pub struct ReconcileSpan;

impl ReconcileSpan {
    /// Fields `status` and `error.message` are filled by `SpanExt::record_result`;
    /// `to_start`, `to_reload` and `to_retire` hold the change set sizes.
    pub fn new(model: &str) -> Span {
        info_span!(
            "reconcile_model",
            model = %model,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            to_start = tracing::field::Empty,
            to_reload = tracing::field::Empty,
            to_retire = tracing::field::Empty,
        )
    }
}
