//! Graceful shutdown coordination via `CancellationToken`.
//!
//! A single shutdown path runs on SIGINT/SIGTERM: cancel all timers,
//! stop every worker, close persistence, then exit, with a hard
//! deadline after which the process force-exits.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Hard deadline for graceful shutdown before tasks are aborted.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Coordinates graceful shutdown across server tasks.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Create a new coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            task_handles: Mutex::new(Vec::new()),
        }
    }

    /// Register a background task to be awaited during shutdown.
    pub fn register_task(&self, handle: JoinHandle<()>) {
        self.task_handles.lock().push(handle);
    }

    /// Clone of the cancellation token.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been initiated.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token, wait up to `deadline` for registered tasks,
    /// then abort stragglers.
    pub async fn graceful_shutdown(&self, deadline: Option<Duration>) {
        let deadline = deadline.unwrap_or(SHUTDOWN_DEADLINE);
        self.shutdown();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.task_handles.lock());
        info!(
            task_count = handles.len(),
            deadline_secs = deadline.as_secs(),
            "waiting for tasks to finish"
        );

        let abort_handles: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        match tokio::time::timeout(deadline, futures::future::join_all(handles)).await {
            Ok(_) => info!("shutdown tasks completed"),
            Err(_) => {
                warn!(deadline_secs = deadline.as_secs(), "shutdown deadline hit, aborting tasks");
                for handle in &abort_handles {
                    handle.abort();
                }
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_not_shutting_down() {
        let coord = ShutdownCoordinator::new();
        assert!(!coord.is_shutting_down());
        coord.shutdown();
        assert!(coord.is_shutting_down());
    }

    #[test]
    fn shutdown_is_idempotent() {
        let coord = ShutdownCoordinator::new();
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
    }

    #[tokio::test]
    async fn token_resolves_on_shutdown() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let waiter = tokio::spawn(async move {
            token.cancelled().await;
        });
        coord.shutdown();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn graceful_waits_for_cooperative_tasks() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let coord = ShutdownCoordinator::new();
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let token = coord.token();
        coord.register_task(tokio::spawn(async move {
            token.cancelled().await;
            done2.store(true, Ordering::SeqCst);
        }));

        coord.graceful_shutdown(Some(Duration::from_secs(5))).await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn graceful_aborts_stuck_tasks_after_deadline() {
        let coord = ShutdownCoordinator::new();
        coord.register_task(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        }));
        // Completes promptly despite the stuck task.
        coord
            .graceful_shutdown(Some(Duration::from_millis(100)))
            .await;
        assert!(coord.is_shutting_down());
    }
}
