//! Hosting several reconcilers in one process.
//!
//! A [`Controller`] owns the process-wide [`ShutdownCoordinator`], starts
//! every registered [`WorkerGroup`], listens for termination signals and
//! serves the admin endpoints. [`Controller::run`] returns once shutdown has
//! been triggered and every worker has drained.

use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::admin::{self, AdminState};
use crate::engine::WorkerGroup;
use crate::error::{Error, Result};
use crate::shutdown::ShutdownCoordinator;

/// Process host for reconcilers.
pub struct Controller {
    coordinator: ShutdownCoordinator,
    groups: Vec<Arc<dyn WorkerGroup>>,
    admin_addr: Option<SocketAddr>,
    metrics: Option<PrometheusHandle>,
    listen_for_signals: bool,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("groups", &self.groups.iter().map(|g| g.name()).collect::<Vec<_>>())
            .field("admin_addr", &self.admin_addr)
            .field("listen_for_signals", &self.listen_for_signals)
            .finish_non_exhaustive()
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller {
    /// Creates a controller with no reconcilers and no admin server.
    #[must_use]
    pub fn new() -> Self {
        Self {
            coordinator: ShutdownCoordinator::new(),
            groups: Vec::new(),
            admin_addr: None,
            metrics: None,
            listen_for_signals: true,
        }
    }

    /// Returns the shutdown coordinator shared by every worker.
    #[must_use]
    pub const fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    /// Registers a reconciler.
    #[must_use]
    pub fn with_group(mut self, group: Arc<dyn WorkerGroup>) -> Self {
        self.groups.push(group);
        self
    }

    /// Serves the admin endpoints on `addr`.
    #[must_use]
    pub const fn with_admin(mut self, addr: SocketAddr) -> Self {
        self.admin_addr = Some(addr);
        self
    }

    /// Serves `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Disables the SIGINT/SIGTERM listener.
    #[must_use]
    pub const fn without_signal_listener(mut self) -> Self {
        self.listen_for_signals = false;
        self
    }

    /// Runs until shutdown is triggered and every worker has drained.
    ///
    /// # Errors
    ///
    /// Returns an error if the admin listener cannot be bound.
    pub async fn run(self) -> Result<()> {
        let drained = CancellationToken::new();

        let admin = match self.admin_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| Error::configuration(format!("failed to bind {addr}: {e}")))?;
                let mut state = AdminState::new(self.coordinator.clone());
                if let Some(handle) = self.metrics.clone() {
                    state = state.with_metrics(handle);
                }
                let drained = drained.clone();
                Some(tokio::spawn(admin::serve(listener, state, async move {
                    drained.cancelled().await;
                })))
            }
            None => None,
        };

        let signals = self
            .listen_for_signals
            .then(|| self.coordinator.listen_for_signals());

        for group in &self.groups {
            tracing::info!(reconciler = group.name(), "starting reconciler");
            Arc::clone(group).start(&self.coordinator);
        }

        self.coordinator.triggered().await;
        tracing::info!("draining workers");
        self.coordinator.wait().await;
        tracing::info!("all workers drained");

        drained.cancel();
        if let Some(admin) = admin {
            match admin.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "admin server failed"),
                Err(e) => tracing::warn!(error = %e, "admin server task failed"),
            }
        }
        if let Some(signals) = signals {
            signals.abort();
        }
        Ok(())
    }
}
