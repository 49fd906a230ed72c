//! Deduplicated, durable events attached to objects.
//!
//! An event is unique by `(reason, note, type, attached object)`. Recording
//! the same event again increments its count and refreshes its last observed
//! time instead of adding a row. Events are never deleted by the engine.
//!
//! This module provides:
//!
//! - [`EventStore`]: Trait over event persistence
//! - [`EventRecorder`]: Find-or-create-or-increment on top of a store
//! - [`memory::InMemoryEventStore`]: In-memory store for testing

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_core::ObjectId;

use crate::error::{Error, Result};
use crate::handler::HandlerError;
use crate::metrics::ReconcileMetrics;

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Expected progress.
    Normal,
    /// Something needs attention.
    Warning,
}

impl EventType {
    /// Returns the type as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The identifying content of an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventSpec {
    /// Short machine-readable reason (e.g. `Created`, `NotUpdated`).
    pub reason: String,
    /// Human-readable detail.
    pub note: String,
    /// Severity.
    #[serde(rename = "Type")]
    pub event_type: EventType,
}

impl EventSpec {
    /// Creates a `Normal` event.
    #[must_use]
    pub fn normal(reason: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            note: note.into(),
            event_type: EventType::Normal,
        }
    }

    /// Creates a `Warning` event.
    #[must_use]
    pub fn warning(reason: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            note: note.into(),
            event_type: EventType::Warning,
        }
    }
}

/// Lookup key of an event row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    /// Event content.
    pub spec: EventSpec,
    /// Object the event is attached to.
    pub object_id: ObjectId,
}

/// A persisted event row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Event {
    /// Store-assigned identifier.
    #[serde(rename = "ID")]
    pub id: u64,
    /// Short machine-readable reason.
    pub reason: String,
    /// Human-readable detail.
    pub note: String,
    /// Severity.
    #[serde(rename = "Type")]
    pub event_type: EventType,
    /// Number of times the event was observed.
    pub count: u64,
    /// First observation.
    pub event_time: DateTime<Utc>,
    /// Latest observation.
    pub last_observed_time: DateTime<Utc>,
    /// Reconciler that reported the event.
    pub reporting_controller: String,
    /// Object the event is attached to.
    #[serde(rename = "AttachedObjectID")]
    pub attached_object_id: Option<ObjectId>,
}

impl Event {
    /// Returns true if this row matches `key`.
    #[must_use]
    pub fn matches(&self, key: &EventKey) -> bool {
        self.reason == key.spec.reason
            && self.note == key.spec.note
            && self.event_type == key.spec.event_type
            && self.attached_object_id.as_ref() == Some(&key.object_id)
    }
}

/// Event persistence.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Returns every row matching `key`.
    async fn find(&self, key: &EventKey) -> Result<Vec<Event>>;

    /// Creates an unattached event with a count of 1.
    async fn create(&self, spec: &EventSpec, reporting_controller: &str) -> Result<Event>;

    /// Attaches an event to an object.
    async fn attach(&self, event_id: u64, object_id: &ObjectId) -> Result<()>;

    /// Replaces the mutable fields (count, last observed time) of a row.
    async fn update(&self, event: &Event) -> Result<()>;
}

/// Records deduplicated events for one reconciler.
#[derive(Clone)]
pub struct EventRecorder {
    store: Arc<dyn EventStore>,
    reporting_controller: String,
    metrics: ReconcileMetrics,
}

impl fmt::Debug for EventRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecorder")
            .field("reporting_controller", &self.reporting_controller)
            .finish_non_exhaustive()
    }
}

impl EventRecorder {
    /// Creates a recorder reporting as `reporting_controller`.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, reporting_controller: impl Into<String>) -> Self {
        let reporting_controller = reporting_controller.into();
        Self {
            store,
            metrics: ReconcileMetrics::new(reporting_controller.clone()),
            reporting_controller,
        }
    }

    /// Returns the reporting controller name.
    #[must_use]
    pub fn reporting_controller(&self) -> &str {
        &self.reporting_controller
    }

    /// Records `spec` against `object_id`.
    ///
    /// Creates and attaches a new row the first time; afterwards increments
    /// the existing row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateEvents`] if more than one row already
    /// matches, or any store error.
    #[tracing::instrument(skip(self, spec, object_id), fields(reason = %spec.reason, object_id = %object_id))]
    pub async fn record_event(&self, spec: &EventSpec, object_id: &ObjectId) -> Result<Event> {
        let key = EventKey {
            spec: spec.clone(),
            object_id: object_id.clone(),
        };
        let mut existing = self.store.find(&key).await?;

        let event = match existing.len() {
            0 => {
                let mut event = self.store.create(spec, &self.reporting_controller).await?;
                self.store.attach(event.id, object_id).await?;
                event.attached_object_id = Some(object_id.clone());
                event
            }
            1 => {
                let mut event = existing.remove(0);
                event.count += 1;
                event.last_observed_time = Utc::now();
                self.store.update(&event).await?;
                event
            }
            count => {
                return Err(Error::DuplicateEvents {
                    count,
                    reason: spec.reason.clone(),
                    object_id: object_id.clone(),
                });
            }
        };

        self.metrics.record_event(&spec.reason);
        Ok(event)
    }

    /// Records the event for a handler failure.
    ///
    /// Uses the event attached to `error` if there is one, `default`
    /// otherwise. Recording failures are logged and swallowed.
    pub async fn handle_event_override(
        &self,
        default: EventSpec,
        object_id: &ObjectId,
        error: &HandlerError,
    ) {
        let spec = error.event().cloned().unwrap_or(default);
        self.record_logged(&spec, object_id).await;
    }

    /// Records an event, logging instead of returning failures.
    pub async fn record_logged(&self, spec: &EventSpec, object_id: &ObjectId) {
        if let Err(e) = self.record_event(spec, object_id).await {
            tracing::warn!(
                reason = %spec.reason,
                object_id = %object_id,
                error = %e,
                "failed to record event"
            );
        }
    }
}
