//! Error types for the reconciliation domain.

use keel_core::ObjectId;

/// The result type used throughout keel-reconcile.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reconciling objects.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested object does not exist in the canonical store.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Resource kind (object type tag).
        resource: String,
        /// Identifier that was looked up.
        id: String,
    },

    /// A payload could not be decoded.
    #[error("decode error: {message}")]
    Decode {
        /// Description of the decode failure.
        message: String,
    },

    /// A broker operation failed.
    #[error("broker error: {message}")]
    Broker {
        /// Description of the broker failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The broker-side stream a consumer binds to does not exist.
    #[error("stream not found: {stream}")]
    StreamNotFound {
        /// Stream name.
        stream: String,
    },

    /// A canonical or event store operation failed.
    #[error("store error: {message}")]
    Store {
        /// Description of the store failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration is missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A notification violated the reconciler's protocol expectations.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the violation.
        message: String,
    },

    /// More than one event row matched a single event key.
    #[error("found {count} events with reason {reason:?} for object {object_id}")]
    DuplicateEvents {
        /// Number of matching rows.
        count: usize,
        /// Event reason of the key.
        reason: String,
        /// Object the events are attached to.
        object_id: ObjectId,
    },

    /// An error from keel-core.
    #[error("core error: {0}")]
    Core(#[from] keel_core::Error),
}

impl Error {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.to_string(),
        }
    }

    /// Creates a decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates a broker error.
    #[must_use]
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a store error.
    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a store error with a source.
    #[must_use]
    pub fn store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Returns true if this error means the object does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Core(inner) => inner.is_not_found(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn not_found_display_and_predicate() {
        let err = Error::not_found("Workload", 42_u64);
        assert_eq!(err.to_string(), "Workload not found: 42");
        assert!(err.is_not_found());
    }

    #[test]
    fn core_not_found_is_not_found() {
        let err: Error = keel_core::Error::NotFound("bucket".into()).into();
        assert!(err.is_not_found());
        assert!(!Error::broker("down").is_not_found());
    }

    #[test]
    fn store_error_preserves_source() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout");
        let err = Error::store_with_source("fetch failed", io);
        assert!(err.source().is_some());
    }

    #[test]
    fn duplicate_events_display() {
        let err = Error::DuplicateEvents {
            count: 2,
            reason: "Created".into(),
            object_id: ObjectId::from(7_u64),
        };
        assert!(err.to_string().contains("found 2 events"));
    }
}
