use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::task::JoinSet;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;

/// Time subtasks get to finish after cancellation before they are aborted.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Tracks background subtasks and shuts them down together.
#[derive(Debug, Clone)]
pub struct TaskManager {
    pub cancellation_token: CancellationToken,
    tasks: Arc<tokio::sync::Mutex<JoinSet<()>>>,
    grace: Duration,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::with_grace(SHUTDOWN_TIMEOUT)
    }

    pub fn with_grace(grace: Duration) -> Self {
        TaskManager {
            cancellation_token: CancellationToken::new(),
            tasks: Arc::new(tokio::sync::Mutex::new(JoinSet::new())),
            grace,
        }
    }

    /// Spawn `future` as a subtask. Must be called from within a runtime.
    pub fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let subtasks = self.tasks.clone();
        tokio::spawn(async move {
            let mut subtasks = subtasks.lock().await;
            // Reap finished tasks so the set does not grow without bound.
            while subtasks.try_join_next().is_some() {}
            subtasks.spawn(future);
        });
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Cancel every subtask, wait up to the grace period for them to finish,
    /// then abort whatever is left.
    pub async fn shutdown(&self) {
        self.cancellation_token.cancel();
        // Let pending registrations reach the join set.
        tokio::task::yield_now().await;

        let completed = AtomicUsize::new(0);
        let mut tasks = self.tasks.lock().await;
        let drained = timeout(self.grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = ?e, "subtask failed");
                }
                completed.fetch_add(1, Ordering::Relaxed);
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = tasks.len(), "subtasks did not stop in time, aborting");
        }
        tasks.shutdown().await;

        tracing::debug!(
            completed = completed.load(Ordering::Relaxed),
            "task manager shut down"
        );
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        TaskManager::new()
    }
}
