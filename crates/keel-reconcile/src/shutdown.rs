//! Process-wide graceful shutdown.
//!
//! A single [`ShutdownCoordinator`] is shared by every worker in the
//! process. Triggering it (SIGINT, SIGTERM or the admin endpoint) cancels
//! the shared token; workers finish or abandon their current delivery and
//! exit their loop. [`ShutdownCoordinator::wait`] returns once every tracked
//! task has exited.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Shared cancellation token plus a tracker of the tasks it governs.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl ShutdownCoordinator {
    /// Creates a coordinator that has not been triggered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a clone of the shared token.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Returns whether shutdown has been triggered.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Triggers shutdown. Idempotent.
    pub fn trigger(&self, source: &str) {
        if !self.token.is_cancelled() {
            tracing::info!(source, "shutdown triggered");
        }
        self.token.cancel();
    }

    /// Completes when shutdown has been triggered.
    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }

    /// Spawns a task that [`ShutdownCoordinator::wait`] waits for.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Returns the number of tracked tasks still running.
    #[must_use]
    pub fn tasks_running(&self) -> usize {
        self.tracker.len()
    }

    /// Waits for every tracked task to exit.
    ///
    /// Closes the tracker; tasks spawned afterwards are still waited for.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Spawns a listener that triggers shutdown on SIGINT or SIGTERM.
    ///
    /// The listener exits on its own when shutdown is triggered elsewhere.
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                source = wait_for_signal() => coordinator.trigger(source),
                () = coordinator.triggered() => {}
            }
        })
    }
}

/// Completes on the first termination signal, returning its name.
pub async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot install SIGTERM handler; listening for SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_cancels_shared_token() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();
        assert!(!token.is_cancelled());

        coordinator.trigger("test");
        coordinator.trigger("test again");
        assert!(token.is_cancelled());
        assert!(coordinator.is_triggered());
    }

    #[tokio::test]
    async fn wait_returns_after_tracked_tasks_exit() {
        let coordinator = ShutdownCoordinator::new();
        for _ in 0..3 {
            let token = coordinator.token();
            coordinator.spawn(async move {
                token.cancelled().await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            });
        }
        assert_eq!(coordinator.tasks_running(), 3);

        coordinator.trigger("test");
        tokio::time::timeout(Duration::from_secs(2), coordinator.wait())
            .await
            .expect("tasks drain");
        assert_eq!(coordinator.tasks_running(), 0);
    }

    #[tokio::test]
    async fn signal_listener_exits_when_triggered_elsewhere() {
        let coordinator = ShutdownCoordinator::new();
        let listener = coordinator.listen_for_signals();
        coordinator.trigger("admin");
        tokio::time::timeout(Duration::from_secs(2), listener)
            .await
            .expect("listener exits")
            .expect("listener task");
    }
}
