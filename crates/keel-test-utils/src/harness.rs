//! A reconciler wired to in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use keel_core::kv::{BucketConfig, KvProvider, KvStore, MemoryKv};
use keel_core::{ObjectId, ObjectLock, WorkerId};
use keel_reconcile::engine::{Disposition, Reconciler, ReconcilerConfig, ReconcilerDeps};
use keel_reconcile::events::memory::InMemoryEventStore;
use keel_reconcile::events::{EventRecorder, EventStore};
use keel_reconcile::handler::ReconcileHandler;
use keel_reconcile::notification::memory::{InMemoryBroker, NakRecord};
use keel_reconcile::notification::{
    Broker, ConsumerConfig, Delivery, Notification, NotificationChannel, Operation,
    DEFAULT_ACK_WAIT,
};
use keel_reconcile::store::memory::InMemoryObjectStore;
use keel_reconcile::store::ObjectClient;

use crate::fixtures::{TestObject, TEST_OBJECT_TYPE, TEST_OBJECT_VERSION, TEST_STREAM, TEST_SUBJECT};
use crate::handler::ScriptedHandler;
use crate::kv::FlakyKv;

/// Reconciler name used by every harness.
pub const HARNESS_RECONCILER: &str = "TestObjectReconciler";

/// How long harness helpers wait for a delivery.
pub const PULL_TIMEOUT: Duration = Duration::from_secs(2);

/// Builder for [`TestHarness`].
#[derive(Debug)]
pub struct HarnessBuilder {
    config: ReconcilerConfig,
    handler: ScriptedHandler,
    ack_wait: Duration,
    bucket_ttl: Duration,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            config: ReconcilerConfig::new(HARNESS_RECONCILER)
                .with_poll_timeout(Duration::from_millis(100)),
            handler: ScriptedHandler::new(),
            ack_wait: DEFAULT_ACK_WAIT,
            bucket_ttl: keel_core::kv::DEFAULT_BUCKET_TTL,
        }
    }
}

impl HarnessBuilder {
    /// Adjusts the reconciler config.
    #[must_use]
    pub fn config(mut self, f: impl FnOnce(ReconcilerConfig) -> ReconcilerConfig) -> Self {
        self.config = f(self.config);
        self
    }

    /// Uses `handler` instead of an always-succeeding one.
    #[must_use]
    pub fn handler(mut self, handler: ScriptedHandler) -> Self {
        self.handler = handler;
        self
    }

    /// Sets the consumer's ack wait.
    #[must_use]
    pub const fn ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Sets the lock bucket TTL.
    #[must_use]
    pub const fn bucket_ttl(mut self, ttl: Duration) -> Self {
        self.bucket_ttl = ttl;
        self
    }

    /// Wires everything up.
    pub async fn build(self) -> TestHarness {
        let broker = InMemoryBroker::new();
        broker
            .create_stream(TEST_STREAM, ["control.>"])
            .expect("create stream");
        let channel = broker
            .bind_consumer(
                ConsumerConfig::for_reconciler(&self.config.name, TEST_STREAM, TEST_SUBJECT)
                    .with_ack_wait(self.ack_wait),
            )
            .await
            .expect("bind consumer");

        let bucket = MemoryKv::new()
            .bind_bucket(BucketConfig::new("reconciler-locks").with_ttl(self.bucket_ttl))
            .await
            .expect("bind bucket");
        let kv = Arc::new(FlakyKv::new(bucket));

        let store = Arc::new(
            InMemoryObjectStore::new(TEST_OBJECT_TYPE).with_publisher(
                broker.clone(),
                TEST_SUBJECT,
                TEST_OBJECT_VERSION,
            ),
        );
        let events = Arc::new(InMemoryEventStore::new());
        let handler = Arc::new(self.handler);

        let lock_bucket: Arc<dyn KvStore> = kv.clone();
        let store_client: Arc<dyn ObjectClient<TestObject>> = store.clone();
        let event_store: Arc<dyn EventStore> = events.clone();
        let handler_dyn: Arc<dyn ReconcileHandler<TestObject>> = handler.clone();

        let reconciler = Arc::new(Reconciler::new(
            self.config.clone(),
            ReconcilerDeps {
                channel: Arc::clone(&channel),
                lock: ObjectLock::new(lock_bucket, self.config.name.clone(), WorkerId::generate()),
                store: store_client,
                recorder: EventRecorder::new(event_store, self.config.name),
            },
            handler_dyn,
        ));

        TestHarness {
            broker,
            channel,
            kv,
            store,
            events,
            handler,
            reconciler,
        }
    }
}

/// A reconciler over an in-memory broker, bucket, store and event store.
pub struct TestHarness {
    /// Broker the store publishes to.
    pub broker: InMemoryBroker,
    /// The reconciler's subscription.
    pub channel: Arc<dyn NotificationChannel>,
    /// Lock bucket, with failure injection.
    pub kv: Arc<FlakyKv>,
    /// Canonical store.
    pub store: Arc<InMemoryObjectStore<TestObject>>,
    /// Event rows.
    pub events: Arc<InMemoryEventStore>,
    /// Handler the reconciler calls.
    pub handler: Arc<ScriptedHandler>,
    /// The reconciler under test.
    pub reconciler: Arc<Reconciler<TestObject>>,
}

impl std::fmt::Debug for TestHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHarness")
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

impl TestHarness {
    /// Returns a builder.
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// Builds a harness with an always-succeeding handler.
    pub async fn new() -> Self {
        Self::builder().build().await
    }

    /// Durable consumer name of the reconciler.
    pub fn consumer(&self) -> &str {
        self.channel.consumer_name()
    }

    /// Stores `object`, publishing `Created` or `Updated`.
    pub fn seed(&self, object: TestObject) {
        self.store.upsert(object).expect("upsert");
    }

    /// Publishes a notification for `object` without touching the store.
    pub fn publish(&self, operation: Operation, object: &TestObject) -> String {
        let notification =
            Notification::new(operation, object.version.clone(), object).expect("encode");
        self.broker
            .publish_notification(TEST_SUBJECT, &notification)
            .expect("publish")
    }

    /// Publishes an arbitrary payload on the reconciler's subject.
    pub fn publish_raw(&self, payload: impl Into<Bytes>) -> String {
        self.broker.publish(TEST_SUBJECT, payload).expect("publish")
    }

    /// Returns a lock on the same bucket held by a different worker.
    pub fn rival_lock(&self) -> ObjectLock {
        let bucket: Arc<dyn KvStore> = Arc::clone(self.kv.inner());
        ObjectLock::new(bucket, HARNESS_RECONCILER, WorkerId::generate())
    }

    /// Returns whether a lock entry for `id` is present in the bucket.
    pub async fn lock_present(&self, id: u64) -> bool {
        let key = self.rival_lock().key(&ObjectId::from(id));
        self.kv.inner().get(&key).await.expect("read lock").is_some()
    }

    /// Pulls the next delivery, panicking if none arrives.
    pub async fn next_delivery(&self) -> Delivery {
        self.channel
            .pull(PULL_TIMEOUT)
            .await
            .expect("pull")
            .expect("a delivery within the pull timeout")
    }

    /// Pulls and processes the next delivery.
    pub async fn process_next(&self) -> Disposition {
        let delivery = self.next_delivery().await;
        self.reconciler
            .process(&delivery, &CancellationToken::new())
            .await
    }

    /// Message IDs acked by the reconciler's consumer.
    pub fn acked(&self) -> Vec<String> {
        self.broker.acked(self.consumer()).expect("acked")
    }

    /// Naks recorded by the reconciler's consumer.
    pub fn naks(&self) -> Vec<NakRecord> {
        self.broker.naks(self.consumer()).expect("naks")
    }
}
