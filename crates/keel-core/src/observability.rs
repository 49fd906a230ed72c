//! Logging initialization and span helpers.
//!
//! Every reconciler process logs through `tracing`. This module installs a
//! subscriber once per process and provides span constructors so log lines
//! carry the same fields across reconcilers.

use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Error;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(Error::InvalidInput(format!("unknown log format: {other}"))),
        }
    }
}

/// Initializes the logging subsystem at `info`.
///
/// Safe to call multiple times; subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Overrides the default level (e.g., `keel_reconcile=debug`)
pub fn init_logging(format: LogFormat) {
    init_logging_with_default(format, "info");
}

/// Initializes the logging subsystem with a fallback filter directive.
///
/// `RUST_LOG` wins when set. Otherwise `default_directive` is used, falling
/// back to `info` if it does not parse.
///
/// # Example
///
/// ```rust
/// use keel_core::observability::{init_logging_with_default, LogFormat};
///
/// init_logging_with_default(LogFormat::Json, "debug");
/// ```
pub fn init_logging_with_default(format: LogFormat, default_directive: &str) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_directive))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        // A subscriber installed by the host process takes precedence.
        let _ = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };
    });
}

/// Creates the span that wraps handling of one delivered notification.
///
/// `object_id` and `operation` start empty and are recorded once the
/// payload is decoded.
///
/// # Example
///
/// ```rust
/// use keel_core::observability::reconcile_span;
///
/// let span = reconcile_span("WorkloadReconciler", "msg-1");
/// span.record("object_id", "42");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn reconcile_span(reconciler: &str, message_id: &str) -> Span {
    tracing::info_span!(
        "reconcile",
        reconciler = reconciler,
        message_id = message_id,
        object_id = tracing::field::Empty,
        operation = tracing::field::Empty,
    )
}

/// Creates a span for one saga step.
#[must_use]
pub fn saga_step_span(step: &str, phase: &str) -> Span {
    tracing::debug_span!("saga_step", step = step, phase = phase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn log_format_parses() {
        assert_eq!("json".parse::<LogFormat>().ok(), Some(LogFormat::Json));
        assert_eq!(" Pretty ".parse::<LogFormat>().ok(), Some(LogFormat::Pretty));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn reconcile_span_records_late_fields() {
        let span = reconcile_span("R", "msg-1");
        span.record("object_id", "7");
        span.record("operation", "Created");
        let _guard = span.enter();
        tracing::info!("inside reconcile span");
    }
}
