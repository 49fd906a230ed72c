//! The business-logic seam of a reconciler.

use std::time::Duration;

use async_trait::async_trait;

use crate::events::EventSpec;
use crate::object::Reconcilable;
use crate::saga::{BoxError, SagaError};

/// What a successful handler asks the engine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Outcome {
    /// The object reached its desired state.
    #[default]
    Done,
    /// The handler made progress but wants to run again after the delay.
    ///
    /// A zero delay is treated as [`Outcome::Done`].
    RequeueAfter(Duration),
}

/// Result type returned by handlers.
pub type HandlerResult = std::result::Result<Outcome, HandlerError>;

/// A failure reported by a handler.
///
/// The engine requeues the notification and records a warning event. A
/// handler that knows better than the generic `NotCreated`/`NotUpdated`/
/// `NotDeleted` event can attach its own with [`HandlerError::with_event`].
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct HandlerError {
    source: BoxError,
    event: Option<EventSpec>,
}

impl HandlerError {
    /// Wraps an error or message.
    #[must_use]
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
            event: None,
        }
    }

    /// Attaches the event to record instead of the default one.
    #[must_use]
    pub fn with_event(mut self, event: EventSpec) -> Self {
        self.event = Some(event);
        self
    }

    /// Returns the attached event, if any.
    #[must_use]
    pub const fn event(&self) -> Option<&EventSpec> {
        self.event.as_ref()
    }
}

impl From<SagaError> for HandlerError {
    fn from(error: SagaError) -> Self {
        Self::new(error)
    }
}

impl From<crate::error::Error> for HandlerError {
    fn from(error: crate::error::Error) -> Self {
        Self::new(error)
    }
}

impl From<keel_core::Error> for HandlerError {
    fn from(error: keel_core::Error) -> Self {
        Self::new(error)
    }
}

/// Per-type reconciliation logic.
///
/// Handlers receive the latest object fetched from the canonical store.
/// They run with the object's lock held but may run more than once for the
/// same state, so they must be idempotent.
#[async_trait]
pub trait ReconcileHandler<T: Reconcilable>: Send + Sync + 'static {
    /// Drives a newly created object to its desired state.
    async fn created(&self, object: &T) -> HandlerResult;

    /// Drives an updated object to its desired state.
    async fn updated(&self, object: &T) -> HandlerResult;

    /// Tears down everything the object owns.
    async fn deleted(&self, object: &T) -> HandlerResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::StepError;

    #[test]
    fn message_is_the_source() {
        let err = HandlerError::new("disk full");
        assert_eq!(err.to_string(), "disk full");
        assert!(err.event().is_none());
    }

    #[test]
    fn override_event_is_kept() {
        let err = HandlerError::new("quota").with_event(EventSpec::warning("QuotaExceeded", "no capacity"));
        assert_eq!(err.event().map(|e| e.reason.as_str()), Some("QuotaExceeded"));
    }

    #[test]
    fn saga_errors_convert() {
        let saga = SagaError::StepFailed {
            step: "network".into(),
            source: StepError::failed("boom"),
            compensation_failures: Vec::new(),
        };
        let err: HandlerError = saga.into();
        assert!(err.to_string().contains("network"));
    }
}
