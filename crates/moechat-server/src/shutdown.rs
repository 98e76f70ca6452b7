//! Graceful shutdown coordination.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Default wait for background tasks before giving up.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Cancellation signal plus tracking for background tasks (heartbeat,
/// telemetry forwarder, in-flight sessions).
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a new coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn a tracked background task.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _ = self.tracker.spawn(task);
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel everything and wait for tracked tasks to drain.
    pub async fn shutdown(&self, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.token.cancel();
        self.tracker.close();
        info!(
            tasks = self.tracker.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for background tasks"
        );
        if tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("shutdown timed out after {timeout:?}, some tasks may still be running");
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state() {
        let coord = ShutdownCoordinator::new();
        assert!(!coord.is_shutting_down());
        assert!(!coord.token().is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_cancels_tokens() {
        let coord = ShutdownCoordinator::new();
        let t1 = coord.token();
        let t2 = coord.token();
        coord.shutdown(Some(Duration::from_millis(100))).await;
        assert!(coord.is_shutting_down());
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[tokio::test]
    async fn tracked_task_drains_on_shutdown() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let (tx, rx) = tokio::sync::oneshot::channel();

        coord.spawn(async move {
            token.cancelled().await;
            let _ = tx.send(());
        });

        coord.shutdown(None).await;
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_times_out_on_stuck_task() {
        let coord = ShutdownCoordinator::new();
        coord.spawn(async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        });

        coord.shutdown(Some(Duration::from_millis(50))).await;
        assert!(coord.is_shutting_down());
    }
}
