//! Liveness signal for a running task.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::store::TaskStore;
use crate::model::TaskId;

/// Background loop that refreshes a task's `last_heartbeat` while it runs.
///
/// Heartbeat errors are logged and never interrupt the task itself. The loop
/// ends on [`stop`](Self::stop) or when the emitter is dropped.
pub struct HeartbeatEmitter {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl HeartbeatEmitter {
    /// Start beating every `every` on behalf of `worker_id`.
    pub fn start<S: TaskStore + 'static>(
        store: Arc<S>,
        task_id: TaskId,
        worker_id: String,
        every: Duration,
    ) -> Self {
        let token = CancellationToken::new();
        let child = token.clone();
        let every = every.max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await; // Consume immediate first tick

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        match store.heartbeat(task_id, &worker_id).await {
                            Ok(true) => debug!(task_id = %task_id, "heartbeat"),
                            Ok(false) => {
                                warn!(
                                    task_id = %task_id,
                                    worker_id = %worker_id,
                                    "heartbeat rejected, task no longer owned"
                                );
                                break;
                            }
                            Err(e) => warn!(task_id = %task_id, error = %e, "heartbeat failed"),
                        }
                    }
                }
            }
        });

        Self { token, handle }
    }

    /// Stop beating and wait for the loop to exit.
    pub async fn stop(mut self) {
        self.token.cancel();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for HeartbeatEmitter {
    // An aborted unit drops its emitter without `stop`.
    fn drop(&mut self) {
        self.token.cancel();
        self.handle.abort();
    }
}
