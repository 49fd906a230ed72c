//! Development controller running a workload reconciler on in-memory backends.
//!
//! Everything the reconciler talks to (broker, lock bucket, canonical store,
//! event store) lives in this process. Use it to exercise the engine and the
//! admin endpoints locally; it is not a production deployment.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_core::observability::init_logging_with_default;
use keel_core::{BucketConfig, KvProvider, MemoryKv, ObjectId, ObjectLock, WorkerId};
use keel_reconcile::config::ControllerConfig;
use keel_reconcile::metrics::install_prometheus_recorder;
use keel_reconcile::prelude::*;

const STREAM: &str = "CONTROL";
const SUBJECT: &str = "control.workload";
const RECONCILER: &str = "WorkloadReconciler";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Workload {
    #[serde(rename = "ID")]
    id: u64,
    name: String,
    #[serde(default)]
    deletion_scheduled: Option<DateTime<Utc>>,
    #[serde(default)]
    deletion_confirmed: Option<DateTime<Utc>>,
    #[serde(default)]
    reconciled: bool,
}

impl Reconcilable for Workload {
    fn object_id(&self) -> ObjectId {
        ObjectId::from(self.id)
    }

    fn type_tag(&self) -> &str {
        "Workload"
    }

    fn version_tag(&self) -> &str {
        "v1"
    }

    fn deletion_scheduled(&self) -> Option<DateTime<Utc>> {
        self.deletion_scheduled
    }

    fn deletion_confirmed(&self) -> Option<DateTime<Utc>> {
        self.deletion_confirmed
    }

    fn is_reconciled(&self) -> bool {
        self.reconciled
    }

    fn apply_reconciliation(&mut self, update: &ReconciliationUpdate) {
        if let Some(reconciled) = update.reconciled {
            self.reconciled = reconciled;
        }
        if let Some(at) = update.deletion_confirmed {
            self.deletion_confirmed = Some(at);
        }
    }
}

/// Logs what a real workload handler would do.
struct LoggingHandler;

#[async_trait]
impl ReconcileHandler<Workload> for LoggingHandler {
    async fn created(&self, workload: &Workload) -> HandlerResult {
        tracing::info!(id = workload.id, name = %workload.name, "provisioning workload");
        Ok(Outcome::Done)
    }

    async fn updated(&self, workload: &Workload) -> HandlerResult {
        tracing::info!(id = workload.id, name = %workload.name, "updating workload");
        Ok(Outcome::Done)
    }

    async fn deleted(&self, workload: &Workload) -> HandlerResult {
        tracing::info!(id = workload.id, name = %workload.name, "tearing down workload");
        Ok(Outcome::Done)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ControllerConfig::from_env().context("invalid configuration")?;
    init_logging_with_default(config.log_format, config.log_directive());
    tracing::info!(?config, "starting development controller");

    let metrics = install_prometheus_recorder()?;

    let broker = InMemoryBroker::new();
    broker.create_stream(STREAM, ["control.>"])?;

    let kv = MemoryKv::new();
    let bucket = kv
        .bind_bucket(BucketConfig::new("reconciler-locks").with_ttl(config.lock_ttl))
        .await?;

    let store = Arc::new(
        InMemoryObjectStore::<Workload>::new("Workload").with_publisher(broker.clone(), SUBJECT, "v1"),
    );
    let events: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());

    let channel = broker
        .bind_consumer(ConsumerConfig::for_reconciler(RECONCILER, STREAM, SUBJECT))
        .await?;
    let store_client: Arc<dyn ObjectClient<Workload>> = store.clone();

    let reconciler = Arc::new(Reconciler::new(
        config.reconciler_config(RECONCILER, "Workload"),
        ReconcilerDeps {
            channel,
            lock: ObjectLock::new(bucket, RECONCILER, WorkerId::generate()),
            store: store_client,
            recorder: EventRecorder::new(events, RECONCILER),
        },
        Arc::new(LoggingHandler),
    ));

    store.upsert(Workload {
        id: 1,
        name: "demo".to_string(),
        deletion_scheduled: None,
        deletion_confirmed: None,
        reconciled: false,
    })?;

    let admin_addr = SocketAddr::from(([0, 0, 0, 0], config.shutdown_port));
    Controller::new()
        .with_group(reconciler)
        .with_admin(admin_addr)
        .with_metrics(metrics)
        .run()
        .await?;

    tracing::info!("controller stopped");
    Ok(())
}
