//! Admin HTTP surface.
//!
//! - `POST /shutdown`: Triggers graceful shutdown and returns 200 at once
//! - `GET /readyz`: Returns 200 while the process is serving
//! - `GET /metrics`: Prometheus text, or 404 when no recorder is installed
//!
//! The listener stays open until every worker has drained, so `/readyz`
//! and `/metrics` remain reachable during shutdown.

use std::future::Future;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;

use crate::error::{Error, Result};
use crate::shutdown::ShutdownCoordinator;

/// Shared state of the admin router.
#[derive(Clone)]
pub struct AdminState {
    shutdown: ShutdownCoordinator,
    metrics: Option<PrometheusHandle>,
}

impl std::fmt::Debug for AdminState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminState")
            .field("shutdown", &self.shutdown)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl AdminState {
    /// Creates admin state around the process coordinator.
    #[must_use]
    pub const fn new(shutdown: ShutdownCoordinator) -> Self {
        Self {
            shutdown,
            metrics: None,
        }
    }

    /// Serves metrics from `handle` on `/metrics`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Builds the admin router.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/shutdown", post(shutdown_handler))
        .route("/readyz", get(readyz_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn shutdown_handler(State(state): State<AdminState>) -> StatusCode {
    state.shutdown.trigger("admin endpoint");
    StatusCode::OK
}

async fn readyz_handler() -> StatusCode {
    StatusCode::OK
}

async fn metrics_handler(State(state): State<AdminState>) -> Response {
    match state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Serves the admin router on `listener` until `drained` completes.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve<F>(listener: TcpListener, state: AdminState, drained: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "admin server listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(drained)
        .await
        .map_err(|e| Error::configuration(format!("admin server failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn readyz_returns_ok() {
        let app = router(AdminState::new(ShutdownCoordinator::new()));
        let response = app
            .oneshot(Request::get("/readyz").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn shutdown_triggers_coordinator() {
        let coordinator = ShutdownCoordinator::new();
        let app = router(AdminState::new(coordinator.clone()));

        let response = app
            .oneshot(Request::post("/shutdown").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(coordinator.is_triggered());
    }

    #[tokio::test]
    async fn shutdown_requires_post() {
        let coordinator = ShutdownCoordinator::new();
        let app = router(AdminState::new(coordinator.clone()));

        let response = app
            .oneshot(Request::get("/shutdown").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(!coordinator.is_triggered());
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_found() {
        let app = router(AdminState::new(ShutdownCoordinator::new()));
        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serve_stops_after_drain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(
            listener,
            AdminState::new(ShutdownCoordinator::new()),
            async move {
                let _ = rx.await;
            },
        ));

        tx.send(()).expect("signal drain");
        tokio::time::timeout(std::time::Duration::from_secs(2), server)
            .await
            .expect("server stops")
            .expect("join")
            .expect("serve");
    }
}
