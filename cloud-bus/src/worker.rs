use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle for one background pipeline stage: a spawned task plus the
/// cancellation token that tells it to wind down.
///
/// Stage loops are expected to poll their queues with short timeouts
/// (see `POLL_INTERVAL`) so a stop request is observed promptly.
pub struct Worker {
    name: String,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Queue wait used by stage loops between cancellation checks.
pub const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(20);

impl Worker {
    /// Spawn the stage body. The closure receives the worker's token so
    /// the loop can select on cancellation.
    pub fn spawn<F, Fut>(name: &str, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(body(cancel.clone()));
        log::debug!("worker {} started", name);
        Self {
            name: name.to_string(),
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request termination without waiting. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Request termination and wait for the stage to fully exit and
    /// release everything it owns. Idempotent; safe while the stage is
    /// mid-wait on a queue (closing queues and cancelling both wake it).
    pub async fn stop_and_wait(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("worker {} join error: {}", self.name, e);
            }
            log::debug!("worker {} stopped", self.name);
        }
    }
}
