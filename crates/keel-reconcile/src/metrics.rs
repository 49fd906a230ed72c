//! Observability metrics for reconcilers.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `keel_reconcile_total` | Counter | `reconciler`, `disposition` | Deliveries processed by outcome |
//! | `keel_reconcile_duration_seconds` | Histogram | `reconciler`, `operation` | Time to process one delivery |
//! | `keel_requeue_delay_seconds` | Histogram | `reconciler` | Requested redelivery delays |
//! | `keel_lock_contention_total` | Counter | `reconciler` | Deliveries requeued because the object was locked |
//! | `keel_undecodable_total` | Counter | `reconciler` | Deliveries whose payload could not be decoded |
//! | `keel_events_recorded_total` | Counter | `reconciler`, `reason` | Events recorded |
//! | `keel_workers_active` | Gauge | `reconciler` | Running worker tasks |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use keel_reconcile::metrics::ReconcileMetrics;
//!
//! let metrics = ReconcileMetrics::new("WorkloadReconciler");
//! metrics.record_disposition("acked");
//! metrics.observe_duration("Created", 0.25);
//! ```
//!
//! Metrics go through the `metrics` crate facade. The controller binary
//! installs a Prometheus recorder and serves it on the admin port.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::{Error, Result};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Deliveries processed by disposition.
    pub const RECONCILE_TOTAL: &str = "keel_reconcile_total";
    /// Histogram: Time to process one delivery in seconds.
    pub const RECONCILE_DURATION_SECONDS: &str = "keel_reconcile_duration_seconds";
    /// Histogram: Requested redelivery delay in seconds.
    pub const REQUEUE_DELAY_SECONDS: &str = "keel_requeue_delay_seconds";
    /// Counter: Deliveries requeued because the object lock was held.
    pub const LOCK_CONTENTION_TOTAL: &str = "keel_lock_contention_total";
    /// Counter: Deliveries whose notification or object payload failed to decode.
    pub const UNDECODABLE_TOTAL: &str = "keel_undecodable_total";
    /// Counter: Events recorded by reason.
    pub const EVENTS_RECORDED_TOTAL: &str = "keel_events_recorded_total";
    /// Gauge: Running worker tasks.
    pub const WORKERS_ACTIVE: &str = "keel_workers_active";
}

/// Label keys used across metrics.
pub mod labels {
    /// Reconciler name.
    pub const RECONCILER: &str = "reconciler";
    /// Delivery disposition (acked, skipped, requeued, raw_requeued, interrupted).
    pub const DISPOSITION: &str = "disposition";
    /// Notification operation (Created, Updated, Deleted).
    pub const OPERATION: &str = "operation";
    /// Event reason.
    pub const REASON: &str = "reason";
}

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder, once per process.
///
/// # Errors
///
/// Returns [`Error::Configuration`] if another recorder is already installed.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::configuration(format!("install prometheus recorder: {e}")))?;
    tracing::info!("Prometheus metrics recorder initialized");
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Records metrics for one reconciler.
///
/// Cheap to clone and share across workers.
#[derive(Debug, Clone)]
pub struct ReconcileMetrics {
    reconciler: String,
}

impl ReconcileMetrics {
    /// Creates a recorder labeled with `reconciler`.
    #[must_use]
    pub fn new(reconciler: impl Into<String>) -> Self {
        Self {
            reconciler: reconciler.into(),
        }
    }

    /// Increments `keel_reconcile_total`.
    pub fn record_disposition(&self, disposition: &'static str) {
        counter!(
            names::RECONCILE_TOTAL,
            labels::RECONCILER => self.reconciler.clone(),
            labels::DISPOSITION => disposition,
        )
        .increment(1);
    }

    /// Records processing time in `keel_reconcile_duration_seconds`.
    pub fn observe_duration(&self, operation: &str, duration_secs: f64) {
        histogram!(
            names::RECONCILE_DURATION_SECONDS,
            labels::RECONCILER => self.reconciler.clone(),
            labels::OPERATION => operation.to_string(),
        )
        .record(duration_secs);
    }

    /// Records a requested redelivery delay.
    pub fn observe_requeue_delay(&self, delay: Duration) {
        histogram!(
            names::REQUEUE_DELAY_SECONDS,
            labels::RECONCILER => self.reconciler.clone(),
        )
        .record(delay.as_secs_f64());
    }

    /// Increments `keel_lock_contention_total`.
    pub fn record_lock_contention(&self) {
        counter!(
            names::LOCK_CONTENTION_TOTAL,
            labels::RECONCILER => self.reconciler.clone(),
        )
        .increment(1);
    }

    /// Increments `keel_undecodable_total`.
    pub fn record_undecodable(&self) {
        counter!(
            names::UNDECODABLE_TOTAL,
            labels::RECONCILER => self.reconciler.clone(),
        )
        .increment(1);
    }

    /// Increments `keel_events_recorded_total`.
    pub fn record_event(&self, reason: &str) {
        counter!(
            names::EVENTS_RECORDED_TOTAL,
            labels::RECONCILER => self.reconciler.clone(),
            labels::REASON => reason.to_string(),
        )
        .increment(1);
    }

    /// Adjusts `keel_workers_active` by one.
    pub fn worker_started(&self) {
        gauge!(names::WORKERS_ACTIVE, labels::RECONCILER => self.reconciler.clone()).increment(1.0);
    }

    /// Adjusts `keel_workers_active` by minus one.
    pub fn worker_stopped(&self) {
        gauge!(names::WORKERS_ACTIVE, labels::RECONCILER => self.reconciler.clone()).decrement(1.0);
    }
}

/// A guard that records elapsed time when dropped.
///
/// ## Example
///
/// ```rust,no_run
/// use keel_reconcile::metrics::{ReconcileMetrics, TimingGuard};
///
/// let metrics = ReconcileMetrics::new("WorkloadReconciler");
/// {
///     let _guard = TimingGuard::new(|duration| {
///         metrics.observe_duration("Created", duration.as_secs_f64());
///     });
///     // Process delivery...
/// }
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}
