//! # keel-reconcile
//!
//! Reconciliation engine for keel controllers.
//!
//! Every object-type reconciler in a keel control plane is an instance of
//! the same engine:
//!
//! - **Notification Consumer**: Pull-based, at-least-once delivery over a durable subscription
//! - **Per-object Locking**: KV-backed mutual exclusion with TTL recovery (from keel-core)
//! - **Backoff**: Requeue delays derived from notification age
//! - **Sagas**: Ordered multi-step operations with reverse-order compensation
//! - **Events**: Deduplicated, count-merged events attached to objects
//! - **Shutdown**: One cancellation token, drained workers, admin endpoints
//!
//! ## Core Concepts
//!
//! - **Notification**: A broker message the canonical store publishes when an
//!   object is created, updated or scheduled for deletion
//! - **Reconciler**: The workers of one object type, sharing one durable consumer
//! - **Disposition**: How processing one delivery ended (acked, skipped, requeued)
//!
//! ## Guarantees
//!
//! - **Exclusive**: At most one worker in the fleet reconciles an object at a time
//! - **Convergent**: Handlers always see the latest stored state, never the payload copy
//! - **Never dropped**: Every delivery is acked or requeued; failures retry at the maximum delay
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use keel_core::{BucketConfig, KvProvider, MemoryKv, ObjectLock, WorkerId};
//! use keel_reconcile::prelude::*;
//!
//! # async fn example<T, H>(handler: Arc<H>, store: Arc<dyn ObjectClient<T>>) -> Result<()>
//! # where
//! #     T: Reconcilable + serde::de::DeserializeOwned,
//! #     H: ReconcileHandler<T>,
//! # {
//! let broker = InMemoryBroker::new();
//! broker.create_stream("CONTROL", ["control.>"])?;
//! let channel = broker
//!     .bind_consumer(ConsumerConfig::for_reconciler("Workload", "CONTROL", "control.workload"))
//!     .await?;
//! let bucket = MemoryKv::new().bind_bucket(BucketConfig::new("locks")).await?;
//! let events: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
//!
//! let reconciler = Arc::new(Reconciler::new(
//!     ReconcilerConfig::new("Workload").with_concurrency(4),
//!     ReconcilerDeps {
//!         channel,
//!         lock: ObjectLock::new(bucket, "Workload", WorkerId::generate()),
//!         store,
//!         recorder: EventRecorder::new(events, "Workload"),
//!     },
//!     handler,
//! ));
//!
//! Controller::new().with_group(reconciler).run().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod admin;
pub mod backoff;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod handler;
pub mod metrics;
pub mod notification;
pub mod object;
pub mod saga;
pub mod shutdown;
pub mod store;

pub use error::{Error, Result};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::backoff::BackoffConfig;
    pub use crate::config::ControllerConfig;
    pub use crate::controller::Controller;
    pub use crate::engine::{
        Disposition, Reconciler, ReconcilerConfig, ReconcilerDeps, RequeueReason, WorkerGroup,
    };
    pub use crate::error::{Error, Result};
    pub use crate::events::memory::InMemoryEventStore;
    pub use crate::events::{Event, EventRecorder, EventSpec, EventStore, EventType};
    pub use crate::handler::{HandlerError, HandlerResult, Outcome, ReconcileHandler};
    pub use crate::notification::memory::InMemoryBroker;
    pub use crate::notification::{
        Broker, ConsumerConfig, Delivery, Notification, NotificationChannel, Operation,
    };
    pub use crate::object::{Reconcilable, ReconciliationUpdate};
    pub use crate::saga::{Operations, SagaError, StepError};
    pub use crate::shutdown::ShutdownCoordinator;
    pub use crate::store::memory::InMemoryObjectStore;
    pub use crate::store::ObjectClient;
}
