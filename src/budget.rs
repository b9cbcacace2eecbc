use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, IoAction, Result};

/// Deadline and cancellation shared by every I/O action of one operation.
#[derive(Debug, Clone, Default)]
pub struct OperationBudget {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl OperationBudget {
    /// No deadline; only explicit cancellation stops the operation.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail if the operation was cancelled or its deadline has passed.
    pub fn check(&self, action: IoAction) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled { action });
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Error::Timeout { action });
        }
        Ok(())
    }

    /// Run one I/O action under the budget. The action is dropped as soon as
    /// the deadline passes or the token is cancelled.
    pub async fn run<T, F>(&self, action: IoAction, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(action)?;
        let bounded = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, fut)
                    .await
                    .map_err(|_| Error::Timeout { action })?,
                None => fut.await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled { action }),
            result = bounded => result,
        }
    }
}
