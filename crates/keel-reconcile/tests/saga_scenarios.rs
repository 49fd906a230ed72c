//! Sagas driven from a reconcile handler.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use keel_core::ObjectId;
use keel_reconcile::engine::{Disposition, Reconciler, ReconcilerConfig, ReconcilerDeps, RequeueReason};
use keel_reconcile::events::memory::InMemoryEventStore;
use keel_reconcile::events::EventRecorder;
use keel_reconcile::handler::{HandlerResult, Outcome, ReconcileHandler};
use keel_reconcile::saga::{Operations, SagaError, StepError};
use keel_reconcile::store::memory::InMemoryObjectStore;
use keel_test_utils::{TestHarness, TestObject};
use tokio_util::sync::CancellationToken;

type Log = Arc<Mutex<Vec<String>>>;

fn record(log: &Log, entry: String) {
    log.lock().unwrap().push(entry);
}

/// Builds a saga over `names`; the step named `failing` fails to create.
fn saga(names: &[&str], failing: Option<&str>, log: &Log) -> Operations {
    let mut ops = Operations::new();
    for name in names {
        let name = (*name).to_string();
        let fails = failing == Some(name.as_str());
        let (create_log, delete_log) = (Arc::clone(log), Arc::clone(log));
        let (create_name, delete_name) = (name.clone(), name.clone());
        ops.append_operation(
            name,
            move || {
                let log = Arc::clone(&create_log);
                let name = create_name.clone();
                async move {
                    record(&log, format!("create:{name}"));
                    if fails {
                        Err(StepError::failed(format!("{name} exploded")))
                    } else {
                        Ok(())
                    }
                }
            },
            move || {
                let log = Arc::clone(&delete_log);
                let name = delete_name.clone();
                async move {
                    record(&log, format!("delete:{name}"));
                    Ok(())
                }
            },
        );
    }
    ops
}

#[tokio::test]
async fn second_step_failure_compensates_first_only() {
    let log: Log = Arc::default();
    let ops = saga(&["network", "volume", "instance"], Some("volume"), &log);

    let err = ops.create().await.unwrap_err();
    assert_eq!(err.failed_step(), Some("volume"));
    assert!(matches!(
        &err,
        SagaError::StepFailed { compensation_failures, .. } if compensation_failures.is_empty()
    ));

    let entries = log.lock().unwrap().clone();
    assert_eq!(
        entries,
        vec!["create:network", "create:volume", "delete:network"]
    );
    assert!(!entries.iter().any(|e| e == "create:instance"));
}

struct SagaHandler {
    failing: Option<&'static str>,
    log: Log,
}

impl SagaHandler {
    fn operations(&self) -> Operations {
        saga(&["network", "volume", "instance"], self.failing, &self.log)
    }
}

#[async_trait]
impl ReconcileHandler<TestObject> for SagaHandler {
    async fn created(&self, _object: &TestObject) -> HandlerResult {
        self.operations().create().await?;
        Ok(Outcome::Done)
    }

    async fn updated(&self, object: &TestObject) -> HandlerResult {
        self.created(object).await
    }

    async fn deleted(&self, _object: &TestObject) -> HandlerResult {
        self.operations().delete().await?;
        Ok(Outcome::Done)
    }
}

fn saga_reconciler(harness: &TestHarness, handler: Arc<SagaHandler>) -> Reconciler<TestObject> {
    let events: Arc<InMemoryEventStore> = Arc::clone(&harness.events);
    let store: Arc<InMemoryObjectStore<TestObject>> = Arc::clone(&harness.store);
    Reconciler::new(
        ReconcilerConfig::new("TestObjectReconciler"),
        ReconcilerDeps {
            channel: Arc::clone(&harness.channel),
            lock: harness.rival_lock(),
            store,
            recorder: EventRecorder::new(events, "TestObjectReconciler"),
        },
        handler,
    )
}

#[tokio::test]
async fn failed_saga_surfaces_as_handler_failure_event() {
    let harness = TestHarness::new().await;
    let log: Log = Arc::default();
    let reconciler = saga_reconciler(
        &harness,
        Arc::new(SagaHandler {
            failing: Some("volume"),
            log: Arc::clone(&log),
        }),
    );
    harness.seed(TestObject::new(21));

    let delivery = harness.next_delivery().await;
    let disposition = reconciler.process(&delivery, &CancellationToken::new()).await;
    assert!(matches!(
        disposition,
        Disposition::Requeued {
            reason: RequeueReason::HandlerFailed,
            ..
        }
    ));

    let events = harness.events.events_for(&ObjectId::from(21_u64)).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, "NotCreated");
    assert!(events[0].note.contains("volume"), "note: {}", events[0].note);
    assert_eq!(
        log.lock().unwrap().clone(),
        vec!["create:network", "create:volume", "delete:network"]
    );
}

#[tokio::test]
async fn teardown_runs_every_delete_in_order() {
    let harness = TestHarness::new().await;
    let log: Log = Arc::default();
    let reconciler = saga_reconciler(
        &harness,
        Arc::new(SagaHandler {
            failing: None,
            log: Arc::clone(&log),
        }),
    );
    let object = TestObject::new(22).scheduled_for_deletion();
    harness.store.upsert(object.clone()).unwrap();
    let skipped = harness.next_delivery().await;
    assert_eq!(
        reconciler.process(&skipped, &CancellationToken::new()).await,
        Disposition::Skipped
    );

    harness.publish(keel_reconcile::notification::Operation::Deleted, &object);
    let delivery = harness.next_delivery().await;
    assert_eq!(
        reconciler.process(&delivery, &CancellationToken::new()).await,
        Disposition::Acked
    );
    assert_eq!(
        log.lock().unwrap().clone(),
        vec!["delete:network", "delete:volume", "delete:instance"]
    );
}
