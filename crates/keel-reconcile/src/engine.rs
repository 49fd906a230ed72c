//! The generic reconciliation engine.
//!
//! A [`Reconciler<T>`] drives objects of one type toward their desired
//! state. Each delivery moves through a fixed sequence:
//!
//! ```text
//! Received -> Decoding -> LockChecking -> LockAcquired -> Fetching
//!          -> Dispatching -> Updating -> ReleasingLock -> Acked
//! ```
//!
//! Any failure exits to a requeue: undecodable payloads are requeued with
//! the fixed raw delay, everything else with the backoff delay computed from
//! the notification's creation time. The lock is released on every exit
//! taken after it was acquired, and a delivery is acked only after the
//! store update and the release attempt.
//!
//! ## Delivery guarantees
//!
//! Delivery is at-least-once and the lock is released before the ack, so a
//! handler may see the same state more than once. Handlers must be
//! idempotent.
//!
//! The success event is recorded after the release. Two workers that
//! reconcile the same object back to back can both miss an existing row and
//! insert one each; from then on that event key reports
//! [`Error::DuplicateEvents`] and is logged rather than counted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use keel_core::observability::reconcile_span;
use keel_core::{ObjectId, ObjectLock};

use crate::backoff::BackoffConfig;
use crate::error::Error;
use crate::events::{EventRecorder, EventSpec};
use crate::handler::{HandlerError, HandlerResult, Outcome, ReconcileHandler};
use crate::metrics::ReconcileMetrics;
use crate::notification::{Delivery, Notification, NotificationChannel, Operation};
use crate::object::{Reconcilable, ReconciliationUpdate};
use crate::shutdown::ShutdownCoordinator;
use crate::store::ObjectClient;

/// Default time a single pull waits for a message.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(20);

/// Default time in-flight work may continue after shutdown is triggered.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Pause after a failed pull before pulling again.
const PULL_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Static metadata of one reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Reconciler name; prefixes lock keys and names the durable consumer.
    pub name: String,
    /// Number of workers sharing the subscription.
    pub concurrent_reconciles: usize,
    /// Time a single pull waits for a message.
    pub poll_timeout: Duration,
    /// Time in-flight work may continue after shutdown is triggered.
    pub drain_grace: Duration,
    /// Requeue delay bounds.
    pub backoff: BackoffConfig,
    /// Accepted `ObjectVersion` tags. Empty accepts any.
    pub object_versions: Vec<String>,
}

impl ReconcilerConfig {
    /// Creates a config with one worker and default timings.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrent_reconciles: 1,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            drain_grace: DEFAULT_DRAIN_GRACE,
            backoff: BackoffConfig::default(),
            object_versions: Vec::new(),
        }
    }

    /// Sets the number of workers.
    #[must_use]
    pub fn with_concurrency(mut self, concurrent_reconciles: usize) -> Self {
        self.concurrent_reconciles = concurrent_reconciles;
        self
    }

    /// Sets the pull timeout.
    #[must_use]
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Sets the shutdown drain grace.
    #[must_use]
    pub fn with_drain_grace(mut self, drain_grace: Duration) -> Self {
        self.drain_grace = drain_grace;
        self
    }

    /// Sets requeue delay bounds.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Adds an accepted `ObjectVersion` tag.
    #[must_use]
    pub fn accept_object_version(mut self, version: impl Into<String>) -> Self {
        self.object_versions.push(version.into());
        self
    }

    /// Returns whether notifications tagged `version` are handled.
    #[must_use]
    pub fn accepts_version(&self, version: &str) -> bool {
        self.object_versions.is_empty() || self.object_versions.iter().any(|v| v == version)
    }
}

/// Why a delivery was requeued with backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueReason {
    /// Another worker holds the object lock.
    LockHeld,
    /// The lock store could not be reached.
    LockUnavailable,
    /// The canonical store could not be read or written.
    StoreUnavailable,
    /// The notification carried an operation or version this reconciler rejects.
    Protocol,
    /// The handler returned an error.
    HandlerFailed,
    /// The handler asked to run again later.
    HandlerRequested,
}

impl RequeueReason {
    /// Returns the reason as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LockHeld => "lock_held",
            Self::LockUnavailable => "lock_unavailable",
            Self::StoreUnavailable => "store_unavailable",
            Self::Protocol => "protocol",
            Self::HandlerFailed => "handler_failed",
            Self::HandlerRequested => "handler_requested",
        }
    }
}

/// Terminal outcome of processing one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Reconciled (or found gone) and acknowledged.
    Acked,
    /// Acknowledged without running a handler.
    Skipped,
    /// Nak'd with a backoff or handler-requested delay.
    Requeued {
        /// Redelivery delay.
        delay: Duration,
        /// Why the delivery was requeued.
        reason: RequeueReason,
    },
    /// Undecodable payload, nak'd with the fixed raw delay.
    RawRequeued,
    /// Abandoned after the shutdown drain grace, nak'd with backoff.
    Interrupted {
        /// Redelivery delay.
        delay: Duration,
    },
}

impl Disposition {
    /// Returns the metrics label for this disposition.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::Skipped => "skipped",
            Self::Requeued { .. } => "requeued",
            Self::RawRequeued => "raw_requeued",
            Self::Interrupted { .. } => "interrupted",
        }
    }

    /// Returns true if the delivery was acknowledged.
    #[must_use]
    pub const fn is_acked(&self) -> bool {
        matches!(self, Self::Acked | Self::Skipped)
    }
}

/// Collaborators a reconciler needs.
pub struct ReconcilerDeps<T: Reconcilable> {
    /// Subscription shared by every worker.
    pub channel: Arc<dyn NotificationChannel>,
    /// Per-object lock namespaced by the reconciler name.
    pub lock: ObjectLock,
    /// Canonical store client.
    pub store: Arc<dyn ObjectClient<T>>,
    /// Event recorder.
    pub recorder: EventRecorder,
}

/// Outcome of the work done while holding the lock.
#[derive(Debug)]
enum Settled {
    Ack(Option<EventSpec>),
    Skip,
    Requeue {
        delay: Option<Duration>,
        reason: RequeueReason,
    },
}

impl Settled {
    const fn requeue(reason: RequeueReason) -> Self {
        Self::Requeue {
            delay: None,
            reason,
        }
    }
}

/// A reconciler for objects of type `T`.
pub struct Reconciler<T: Reconcilable> {
    config: ReconcilerConfig,
    channel: Arc<dyn NotificationChannel>,
    lock: ObjectLock,
    store: Arc<dyn ObjectClient<T>>,
    recorder: EventRecorder,
    handler: Arc<dyn ReconcileHandler<T>>,
    metrics: ReconcileMetrics,
}

impl<T: Reconcilable> std::fmt::Debug for Reconciler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .field("consumer", &self.channel.consumer_name())
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl<T> Reconciler<T>
where
    T: Reconcilable + DeserializeOwned,
{
    /// Creates a reconciler.
    #[must_use]
    pub fn new(
        config: ReconcilerConfig,
        deps: ReconcilerDeps<T>,
        handler: Arc<dyn ReconcileHandler<T>>,
    ) -> Self {
        Self {
            metrics: ReconcileMetrics::new(config.name.clone()),
            config,
            channel: deps.channel,
            lock: deps.lock,
            store: deps.store,
            recorder: deps.recorder,
            handler,
        }
    }

    /// Returns the reconciler name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the reconciler config.
    #[must_use]
    pub const fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Processes one delivery to completion, acking or nak'ing it.
    ///
    /// If `shutdown` fires while the lock is held, the in-flight work gets
    /// the configured drain grace to finish before it is abandoned, the lock
    /// released and the delivery requeued.
    pub async fn process(&self, delivery: &Delivery, shutdown: &CancellationToken) -> Disposition {
        let started = Instant::now();
        let span = reconcile_span(&self.config.name, &delivery.message_id);
        let (disposition, operation) = self.process_inner(delivery, shutdown).instrument(span).await;

        self.metrics
            .observe_duration(operation, started.elapsed().as_secs_f64());
        self.metrics.record_disposition(disposition.label());
        disposition
    }

    async fn process_inner(
        &self,
        delivery: &Delivery,
        shutdown: &CancellationToken,
    ) -> (Disposition, &'static str) {
        let notification = match Notification::decode(&delivery.payload) {
            Ok(notification) => notification,
            Err(e) => {
                tracing::error!(error = %e, delivery_count = delivery.delivery_count, "undecodable notification");
                self.metrics.record_undecodable();
                return (self.raw_requeue(delivery).await, "unknown");
            }
        };

        let operation = notification.operation;
        let span = tracing::Span::current();
        span.record("operation", operation.as_str());

        let object: T = match notification.object() {
            Ok(object) => object,
            Err(e) => {
                // Redelivered every raw requeue delay until the payload is fixed.
                tracing::error!(
                    error = %e,
                    delivery_count = delivery.delivery_count,
                    "undecodable object payload"
                );
                self.metrics.record_undecodable();
                return (self.raw_requeue(delivery).await, operation.as_str());
            }
        };
        let object_id = object.object_id();
        span.record("object_id", tracing::field::display(&object_id));

        let delay = self.config.backoff.delay(notification.created_at());
        let disposition = self
            .coordinate(delivery, &notification, &object_id, delay, shutdown)
            .await;
        (disposition, operation.as_str())
    }

    async fn coordinate(
        &self,
        delivery: &Delivery,
        notification: &Notification,
        object_id: &ObjectId,
        delay: Duration,
        shutdown: &CancellationToken,
    ) -> Disposition {
        if self.lock.is_held(object_id).await.assume_held() {
            self.metrics.record_lock_contention();
            return self.requeue(delivery, delay, RequeueReason::LockHeld).await;
        }

        match self.lock.try_acquire(object_id).await {
            Ok(true) => {}
            Ok(false) => {
                self.metrics.record_lock_contention();
                return self.requeue(delivery, delay, RequeueReason::LockHeld).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "lock acquire failed");
                return self
                    .requeue(delivery, delay, RequeueReason::LockUnavailable)
                    .await;
            }
        }

        let work = self.settle_locked(notification, object_id);
        tokio::pin!(work);

        let settled = tokio::select! {
            biased;
            settled = &mut work => settled,
            () = shutdown.cancelled() => {
                if let Ok(settled) = tokio::time::timeout(self.config.drain_grace, &mut work).await {
                    settled
                } else {
                    tracing::warn!(
                        grace_ms = duration_ms(self.config.drain_grace),
                        "drain grace elapsed; abandoning reconciliation"
                    );
                    self.lock.release(object_id).await;
                    return self.interrupt(delivery, delay).await;
                }
            }
        };

        self.lock.release(object_id).await;

        match settled {
            Settled::Ack(event) => {
                self.ack(delivery).await;
                if let Some(spec) = event {
                    self.recorder.record_logged(&spec, object_id).await;
                }
                Disposition::Acked
            }
            Settled::Skip => {
                self.ack(delivery).await;
                Disposition::Skipped
            }
            Settled::Requeue {
                delay: requested,
                reason,
            } => {
                self.requeue(delivery, requested.unwrap_or(delay), reason)
                    .await
            }
        }
    }

    async fn settle_locked(&self, notification: &Notification, object_id: &ObjectId) -> Settled {
        let latest = match self.store.get_by_id(object_id).await {
            Ok(latest) => latest,
            Err(e) if e.is_not_found() => {
                tracing::info!("object no longer exists; acknowledging");
                return Settled::Ack(None);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to fetch object");
                return Settled::requeue(RequeueReason::StoreUnavailable);
            }
        };

        if !self.config.accepts_version(&notification.object_version) {
            let e = Error::protocol(format!(
                "object version {} not handled by {}",
                notification.object_version, self.config.name
            ));
            tracing::error!(error = %e, "rejecting notification");
            return Settled::requeue(RequeueReason::Protocol);
        }

        match notification.operation {
            Operation::Created if latest.deletion_scheduled().is_some() => {
                tracing::info!("deletion already scheduled; skipping create");
                Settled::Skip
            }
            Operation::Created | Operation::Updated => {
                self.converge(notification.operation, &latest, object_id)
                    .await
            }
            Operation::Deleted => self.teardown(&latest, object_id).await,
            Operation::Unrecognized => {
                let e = Error::protocol("unrecognized notification operation");
                tracing::error!(error = %e, "rejecting notification");
                Settled::requeue(RequeueReason::Protocol)
            }
        }
    }

    async fn converge(&self, operation: Operation, latest: &T, object_id: &ObjectId) -> Settled {
        let result = if operation == Operation::Created {
            self.handler.created(latest).await
        } else {
            self.handler.updated(latest).await
        };

        if let Err(settled) = self.handler_outcome(operation, result, object_id).await {
            return settled;
        }

        if let Err(e) = self
            .store
            .update_reconciliation_fields(object_id, &ReconciliationUpdate::reconciled())
            .await
        {
            tracing::warn!(error = %e, "failed to mark object reconciled");
            return Settled::requeue(RequeueReason::StoreUnavailable);
        }

        Settled::Ack(Some(success_event(operation, latest)))
    }

    async fn teardown(&self, latest: &T, object_id: &ObjectId) -> Settled {
        let result = self.handler.deleted(latest).await;
        if let Err(settled) = self
            .handler_outcome(Operation::Deleted, result, object_id)
            .await
        {
            return settled;
        }

        let update = ReconciliationUpdate::deletion_confirmed_at(Utc::now());
        match self
            .store
            .update_reconciliation_fields(object_id, &update)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!(error = %e, "failed to confirm deletion");
                return Settled::requeue(RequeueReason::StoreUnavailable);
            }
        }

        match self.store.delete(object_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!(error = %e, "failed to delete object");
                return Settled::requeue(RequeueReason::StoreUnavailable);
            }
        }

        Settled::Ack(Some(success_event(Operation::Deleted, latest)))
    }

    /// Maps a handler result to the exit to take, if it is not success.
    async fn handler_outcome(
        &self,
        operation: Operation,
        result: HandlerResult,
        object_id: &ObjectId,
    ) -> Result<(), Settled> {
        match result {
            Ok(Outcome::RequeueAfter(requested)) if !requested.is_zero() => {
                let delay = requested.min(self.config.backoff.max);
                tracing::debug!(
                    requested_ms = duration_ms(requested),
                    delay_ms = duration_ms(delay),
                    "handler requested requeue"
                );
                Err(Settled::Requeue {
                    delay: Some(delay),
                    reason: RequeueReason::HandlerRequested,
                })
            }
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "handler failed");
                self.recorder
                    .handle_event_override(failure_event(operation, &e), object_id, &e)
                    .await;
                Err(Settled::requeue(RequeueReason::HandlerFailed))
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.channel.ack(delivery).await {
            tracing::warn!(error = %e, "ack failed; broker will redeliver after ack wait");
        }
    }

    async fn requeue(
        &self,
        delivery: &Delivery,
        delay: Duration,
        reason: RequeueReason,
    ) -> Disposition {
        self.metrics.observe_requeue_delay(delay);
        if let Err(e) = self.channel.nak_with_delay(delivery, delay).await {
            tracing::warn!(error = %e, "nak failed; broker will redeliver after ack wait");
        }
        tracing::debug!(delay_ms = duration_ms(delay), reason = reason.as_str(), "requeued");
        Disposition::Requeued { delay, reason }
    }

    async fn raw_requeue(&self, delivery: &Delivery) -> Disposition {
        if let Err(e) = self.channel.raw_requeue(delivery).await {
            tracing::warn!(error = %e, "raw requeue failed; broker will redeliver after ack wait");
        }
        Disposition::RawRequeued
    }

    async fn interrupt(&self, delivery: &Delivery, delay: Duration) -> Disposition {
        self.metrics.observe_requeue_delay(delay);
        if let Err(e) = self.channel.nak_with_delay(delivery, delay).await {
            tracing::warn!(error = %e, "nak failed; broker will redeliver after ack wait");
        }
        Disposition::Interrupted { delay }
    }

    /// Spawns the configured number of workers under `coordinator`.
    ///
    /// Once every worker has exited, the subscription is unsubscribed.
    pub fn spawn_workers(self: Arc<Self>, coordinator: &ShutdownCoordinator) {
        let workers = TaskTracker::new();
        for worker in 0..self.config.concurrent_reconciles {
            workers.spawn(Arc::clone(&self).run_worker(worker, coordinator.token()));
        }
        workers.close();

        tracing::info!(
            reconciler = %self.config.name,
            workers = self.config.concurrent_reconciles,
            consumer = self.channel.consumer_name(),
            "reconciler started"
        );

        coordinator.spawn(async move {
            workers.wait().await;
            if let Err(e) = self.channel.unsubscribe().await {
                tracing::warn!(reconciler = %self.config.name, error = %e, "unsubscribe failed");
            }
            tracing::info!(reconciler = %self.config.name, "all workers exited");
        });
    }

    #[tracing::instrument(skip(self, shutdown), fields(reconciler = %self.config.name))]
    async fn run_worker(self: Arc<Self>, worker: usize, shutdown: CancellationToken) {
        self.metrics.worker_started();
        loop {
            let pulled = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                pulled = self.channel.pull(self.config.poll_timeout) => pulled,
            };

            match pulled {
                Ok(Some(delivery)) => {
                    self.process(&delivery, &shutdown).await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "pull failed");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(PULL_ERROR_PAUSE) => {}
                    }
                }
            }
        }
        self.metrics.worker_stopped();
        tracing::debug!("worker exited");
    }
}

/// A set of workers the controller can start without knowing `T`.
pub trait WorkerGroup: Send + Sync + 'static {
    /// Name of the group.
    fn name(&self) -> &str;

    /// Spawns the workers under `coordinator`.
    fn start(self: Arc<Self>, coordinator: &ShutdownCoordinator);
}

impl<T> WorkerGroup for Reconciler<T>
where
    T: Reconcilable + DeserializeOwned,
{
    fn name(&self) -> &str {
        &self.config.name
    }

    fn start(self: Arc<Self>, coordinator: &ShutdownCoordinator) {
        self.spawn_workers(coordinator);
    }
}

fn success_event<T: Reconcilable>(operation: Operation, object: &T) -> EventSpec {
    let verb = match operation {
        Operation::Created => "created",
        Operation::Updated => "updated",
        Operation::Deleted => "deleted",
        Operation::Unrecognized => "processed",
    };
    EventSpec::normal(
        operation.as_str(),
        format!("{} {verb}", object.type_tag()),
    )
}

fn failure_event(operation: Operation, error: &HandlerError) -> EventSpec {
    EventSpec::warning(format!("Not{}", operation.as_str()), error.to_string())
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
