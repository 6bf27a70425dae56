//! Extension trait for Coordinator.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use readingflow::{Coordinator, TaskStore};

use crate::server::{run_server, AppState};

/// Adds the HTTP API to a shared [`Coordinator`].
pub trait CoordinatorHarnessExt<S: TaskStore + 'static> {
    /// Serve the job API on `port` in the background until `shutdown` fires.
    fn spawn_http(&self, port: u16, shutdown: CancellationToken) -> JoinHandle<anyhow::Result<()>>;
}

impl<S: TaskStore + 'static> CoordinatorHarnessExt<S> for Arc<Coordinator<S>> {
    fn spawn_http(&self, port: u16, shutdown: CancellationToken) -> JoinHandle<anyhow::Result<()>> {
        let state = AppState::new(self.clone());
        tokio::spawn(async move { run_server(state, port, shutdown).await })
    }
}
