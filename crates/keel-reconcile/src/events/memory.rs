//! In-memory event store for testing.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No persistence
//! - **Single-process only**: Events are not shared across processes

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use keel_core::ObjectId;

use super::{Event, EventKey, EventSpec, EventStore};
use crate::error::{Error, Result};

/// Converts a lock poison error to a store error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::store("event store lock poisoned")
}

#[derive(Debug, Default)]
struct State {
    events: BTreeMap<u64, Event>,
    next_id: u64,
}

impl State {
    fn insert(&mut self, spec: &EventSpec, reporting_controller: &str) -> Event {
        self.next_id += 1;
        let now = Utc::now();
        let event = Event {
            id: self.next_id,
            reason: spec.reason.clone(),
            note: spec.note.clone(),
            event_type: spec.event_type,
            count: 1,
            event_time: now,
            last_observed_time: now,
            reporting_controller: reporting_controller.to_string(),
            attached_object_id: None,
        };
        self.events.insert(event.id, event.clone());
        event
    }
}

/// In-memory event store.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    state: RwLock<State>,
    unavailable: AtomicBool,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every row in ID order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn events(&self) -> Result<Vec<Event>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.events.values().cloned().collect())
    }

    /// Returns rows attached to `object_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn events_for(&self, object_id: &ObjectId) -> Result<Vec<Event>> {
        Ok(self
            .events()?
            .into_iter()
            .filter(|e| e.attached_object_id.as_ref() == Some(object_id))
            .collect())
    }

    /// Inserts an attached row directly, bypassing deduplication.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn insert_row(&self, spec: &EventSpec, object_id: &ObjectId) -> Result<Event> {
        let mut state = self.state.write().map_err(poison_err)?;
        let mut event = state.insert(spec, "seed");
        event.attached_object_id = Some(object_id.clone());
        state.events.insert(event.id, event.clone());
        drop(state);
        Ok(event)
    }

    /// Makes every trait call fail while `unavailable` is set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::store("event store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn find(&self, key: &EventKey) -> Result<Vec<Event>> {
        self.check_available()?;
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .events
            .values()
            .filter(|e| e.matches(key))
            .cloned()
            .collect())
    }

    async fn create(&self, spec: &EventSpec, reporting_controller: &str) -> Result<Event> {
        self.check_available()?;
        let mut state = self.state.write().map_err(poison_err)?;
        Ok(state.insert(spec, reporting_controller))
    }

    async fn attach(&self, event_id: u64, object_id: &ObjectId) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().map_err(poison_err)?;
        let event = state
            .events
            .get_mut(&event_id)
            .ok_or_else(|| Error::not_found("Event", event_id))?;
        event.attached_object_id = Some(object_id.clone());
        Ok(())
    }

    async fn update(&self, event: &Event) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().map_err(poison_err)?;
        let row = state
            .events
            .get_mut(&event.id)
            .ok_or_else(|| Error::not_found("Event", event.id))?;
        row.count = event.count;
        row.last_observed_time = event.last_observed_time;
        Ok(())
    }
}
