use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::context;
use crate::error::{Error, Result};

/// Pool that runs the manager's background workflows.
///
/// Tasks inherit the caller's [`Subject`](crate::context::Subject), a
/// panicking task is logged and never affects the others, and shutdown is
/// two-phased: drain, then cancel and drain again.
pub struct TaskExecutor {
    name: &'static str,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl TaskExecutor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Submits `task`. Fails once shutdown has begun.
    pub fn spawn<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(Error::Machine(format!(
                "{} executor is shut down, task rejected",
                self.name
            )));
        }

        let name = self.name;
        let cancel = self.cancel.clone();
        let subject = context::current();
        self.tracker.spawn(context::scope(subject, async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!(executor = name, "background task cancelled"),
                outcome = AssertUnwindSafe(task).catch_unwind() => {
                    if outcome.is_err() {
                        error!(executor = name, "background task panicked");
                    }
                }
            }
        }));
        Ok(())
    }

    /// Stops accepting work and waits for running tasks.
    ///
    /// Waits up to `timeout`, then cancels whatever is left and waits up to
    /// `timeout` again. Returns whether every task finished.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tracker.close();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok() {
            return true;
        }

        debug!(executor = self.name, pending = self.tracker.len(), "cancelling background tasks");
        self.cancel.cancel();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok() {
            return true;
        }

        warn!(executor = self.name, "Unable terminate main pool");
        false
    }

    pub fn is_terminated(&self) -> bool {
        self.tracker.is_closed() && self.tracker.is_empty()
    }
}
