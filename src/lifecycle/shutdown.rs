//! Shutdown coordination for the service.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to,
/// and keeps the join handles of the tasks spawned through it.
pub struct Shutdown {
    /// Broadcast channel sender.
    tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Get the number of active subscribers (tasks still running).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Spawn a background task that [`drain`](Self::drain) will wait for.
    pub fn spawn<F>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        tracing::debug!(task = %name, "Spawning background task");
        let handle = tokio::spawn(task);
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((name, handle));
    }

    /// Wait for every spawned task, sharing one `grace` deadline.
    ///
    /// Tasks still running at the deadline are aborted. Returns how many
    /// had to be aborted.
    pub async fn drain(&self, grace: Duration) -> usize {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        let deadline = Instant::now() + grace;
        let mut aborted = 0;

        for (name, mut handle) in tasks {
            match time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => tracing::info!(task = %name, "Background task stopped"),
                Ok(Err(e)) => tracing::error!(task = %name, error = %e, "Background task failed"),
                Err(_) => {
                    tracing::warn!(task = %name, grace = ?grace, "Background task did not stop in time, aborting");
                    handle.abort();
                    aborted += 1;
                }
            }
        }

        aborted
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
