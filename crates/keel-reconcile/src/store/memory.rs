//! In-memory canonical store for testing.
//!
//! [`InMemoryObjectStore`] keeps objects in a map and, optionally, publishes
//! a notification to an [`InMemoryBroker`] on every mutation the way the
//! real store does.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No persistence
//! - **Single-process only**: Objects are not shared across processes

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::Serialize;

use keel_core::ObjectId;

use super::ObjectClient;
use crate::error::{Error, Result};
use crate::notification::memory::InMemoryBroker;
use crate::notification::{Notification, Operation};
use crate::object::{Reconcilable, ReconciliationUpdate};

/// Converts a lock poison error to a store error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::store("object store lock poisoned")
}

#[derive(Debug, Clone)]
struct Publisher {
    broker: InMemoryBroker,
    subject: String,
    object_version: String,
}

#[derive(Debug)]
struct StoreState<T> {
    objects: BTreeMap<ObjectId, T>,
    updates: Vec<(ObjectId, ReconciliationUpdate)>,
    deleted: Vec<ObjectId>,
}

/// In-memory canonical store.
#[derive(Debug)]
pub struct InMemoryObjectStore<T> {
    resource: String,
    state: RwLock<StoreState<T>>,
    publisher: Option<Publisher>,
    injected_failures: AtomicUsize,
    failed_updates: AtomicUsize,
    failed_deletes: AtomicUsize,
    vanishing_deletes: AtomicUsize,
    fetches: AtomicUsize,
}

/// Decrements `counter` if it is positive, returning whether it was.
fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl<T> InMemoryObjectStore<T>
where
    T: Reconcilable + Clone + Serialize,
{
    /// Creates an empty store for objects of kind `resource`.
    #[must_use]
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            state: RwLock::new(StoreState {
                objects: BTreeMap::new(),
                updates: Vec::new(),
                deleted: Vec::new(),
            }),
            publisher: None,
            injected_failures: AtomicUsize::new(0),
            failed_updates: AtomicUsize::new(0),
            failed_deletes: AtomicUsize::new(0),
            vanishing_deletes: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Publishes a notification to `broker` on every mutation.
    #[must_use]
    pub fn with_publisher(
        mut self,
        broker: InMemoryBroker,
        subject: impl Into<String>,
        object_version: impl Into<String>,
    ) -> Self {
        self.publisher = Some(Publisher {
            broker,
            subject: subject.into(),
            object_version: object_version.into(),
        });
        self
    }

    /// Inserts or replaces an object.
    ///
    /// Publishes `Created` for new objects and `Updated` otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned or publishing fails.
    pub fn upsert(&self, object: T) -> Result<()> {
        let id = object.object_id();
        let mut state = self.state.write().map_err(poison_err)?;
        let existed = state.objects.insert(id, object.clone()).is_some();
        drop(state);

        let operation = if existed {
            Operation::Updated
        } else {
            Operation::Created
        };
        self.publish(operation, &object)
    }

    /// Publishes a notification for `object` without changing the store.
    ///
    /// A no-op returning success when no publisher is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or publishing fails.
    pub fn publish(&self, operation: Operation, object: &T) -> Result<()> {
        let Some(publisher) = &self.publisher else {
            return Ok(());
        };
        let notification = Notification::new(operation, &publisher.object_version, object)?;
        publisher
            .broker
            .publish_notification(&publisher.subject, &notification)?;
        Ok(())
    }

    /// Returns a stored object.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn get(&self, id: &ObjectId) -> Result<Option<T>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.objects.get(id).cloned())
    }

    /// Returns every reconciliation update applied, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn updates(&self) -> Result<Vec<(ObjectId, ReconciliationUpdate)>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.updates.clone())
    }

    /// Returns every ID removed through [`ObjectClient::delete`].
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn deleted(&self) -> Result<Vec<ObjectId>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.deleted.clone())
    }

    /// Makes the next `count` client calls fail with a store error.
    pub fn fail_next(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` reconciliation updates fail with a store error.
    pub fn fail_updates(&self, count: usize) {
        self.failed_updates.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` deletes fail with a store error.
    pub fn fail_deletes(&self, count: usize) {
        self.failed_deletes.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` deletes find the object already removed by
    /// another writer: the object is dropped and the call reports not found.
    pub fn vanish_on_delete(&self, count: usize) {
        self.vanishing_deletes.store(count, Ordering::SeqCst);
    }

    /// Returns how many times [`ObjectClient::get_by_id`] was called.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn take_injected_failure(&self) -> Result<()> {
        if take(&self.injected_failures) {
            return Err(self.unavailable());
        }
        Ok(())
    }

    fn unavailable(&self) -> Error {
        Error::store(format!("{} store unavailable", self.resource))
    }
}

#[async_trait]
impl<T> ObjectClient<T> for InMemoryObjectStore<T>
where
    T: Reconcilable + Clone + Serialize,
{
    async fn get_by_id(&self, id: &ObjectId) -> Result<T> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.take_injected_failure()?;
        self.get(id)?
            .ok_or_else(|| Error::not_found(&self.resource, id))
    }

    async fn update_reconciliation_fields(
        &self,
        id: &ObjectId,
        update: &ReconciliationUpdate,
    ) -> Result<()> {
        self.take_injected_failure()?;
        if take(&self.failed_updates) {
            return Err(self.unavailable());
        }
        let mut state = self.state.write().map_err(poison_err)?;
        let object = state
            .objects
            .get_mut(id)
            .ok_or_else(|| Error::not_found(&self.resource, id))?;
        object.apply_reconciliation(update);
        state.updates.push((id.clone(), update.clone()));
        drop(state);
        Ok(())
    }

    async fn delete(&self, id: &ObjectId) -> Result<()> {
        self.take_injected_failure()?;
        if take(&self.failed_deletes) {
            return Err(self.unavailable());
        }
        let mut state = self.state.write().map_err(poison_err)?;
        if take(&self.vanishing_deletes) {
            state.objects.remove(id);
            return Err(Error::not_found(&self.resource, id));
        }
        if state.objects.remove(id).is_none() {
            return Err(Error::not_found(&self.resource, id));
        }
        state.deleted.push(id.clone());
        drop(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde::Deserialize;

    use crate::notification::{Broker, ConsumerConfig};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Widget {
        id: u64,
        reconciled: bool,
    }

    impl Reconcilable for Widget {
        fn object_id(&self) -> ObjectId {
            ObjectId::from(self.id)
        }
        fn type_tag(&self) -> &str {
            "Widget"
        }
        fn version_tag(&self) -> &str {
            "v1"
        }
        fn deletion_scheduled(&self) -> Option<DateTime<Utc>> {
            None
        }
        fn deletion_confirmed(&self) -> Option<DateTime<Utc>> {
            None
        }
        fn is_reconciled(&self) -> bool {
            self.reconciled
        }
        fn apply_reconciliation(&mut self, update: &ReconciliationUpdate) {
            if let Some(r) = update.reconciled {
                self.reconciled = r;
            }
        }
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = InMemoryObjectStore::<Widget>::new("Widget");
        let err = store.get_by_id(&ObjectId::from(1_u64)).await.expect_err("missing");
        assert!(err.is_not_found());
        assert!(store.delete(&ObjectId::from(1_u64)).await.expect_err("missing").is_not_found());
    }

    #[tokio::test]
    async fn update_applies_fields() {
        let store = InMemoryObjectStore::new("Widget");
        store.upsert(Widget { id: 3, reconciled: false }).expect("upsert");
        let id = ObjectId::from(3_u64);

        store
            .update_reconciliation_fields(&id, &ReconciliationUpdate::reconciled())
            .await
            .expect("update");

        assert!(store.get(&id).expect("get").expect("present").reconciled);
        assert_eq!(store.updates().expect("updates").len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = InMemoryObjectStore::new("Widget");
        store.upsert(Widget { id: 3, reconciled: false }).expect("upsert");
        store.fail_next(1);

        let id = ObjectId::from(3_u64);
        let err = store.get_by_id(&id).await.expect_err("injected");
        assert!(!err.is_not_found());
        assert!(store.get_by_id(&id).await.is_ok());
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn targeted_failures_only_hit_their_call() {
        let store = InMemoryObjectStore::new("Widget");
        store.upsert(Widget { id: 4, reconciled: false }).expect("upsert");
        let id = ObjectId::from(4_u64);
        store.fail_updates(1);
        store.fail_deletes(1);

        assert!(store.get_by_id(&id).await.is_ok());
        let update = ReconciliationUpdate::reconciled();
        assert!(store.update_reconciliation_fields(&id, &update).await.is_err());
        assert!(store.update_reconciliation_fields(&id, &update).await.is_ok());
        assert!(!store.delete(&id).await.expect_err("injected").is_not_found());
        assert!(store.delete(&id).await.is_ok());
    }

    #[tokio::test]
    async fn vanishing_delete_reports_not_found() {
        let store = InMemoryObjectStore::new("Widget");
        store.upsert(Widget { id: 5, reconciled: false }).expect("upsert");
        let id = ObjectId::from(5_u64);
        store.vanish_on_delete(1);

        assert!(store.delete(&id).await.expect_err("gone").is_not_found());
        assert!(store.get(&id).expect("get").is_none());
        assert!(store.deleted().expect("deleted").is_empty());
    }

    #[tokio::test]
    async fn mutations_publish_notifications() {
        let broker = InMemoryBroker::new();
        broker.create_stream("CONTROL", ["control.>"]).expect("stream");
        let store = InMemoryObjectStore::new("Widget").with_publisher(
            broker.clone(),
            "control.widget",
            "v1",
        );

        store.upsert(Widget { id: 9, reconciled: false }).expect("create");
        store.upsert(Widget { id: 9, reconciled: true }).expect("update");

        let channel = broker
            .bind_consumer(ConsumerConfig::for_reconciler("Widget", "CONTROL", "control.widget"))
            .await
            .expect("bind");
        let first = channel
            .pull(std::time::Duration::from_millis(50))
            .await
            .expect("pull")
            .expect("created");
        let decoded = Notification::decode(&first.payload).expect("decode");
        assert_eq!(decoded.operation, Operation::Created);
        assert_eq!(broker.messages("CONTROL").expect("messages").len(), 2);
    }
}
