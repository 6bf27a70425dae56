//! Job completion notifications.
//!
//! The pipeline only decides *when* a job finished; delivery (email, push,
//! webhook) belongs to whoever implements [`Notifier`].

use async_trait::async_trait;

use crate::progress::JobSnapshot;

/// Receives the terminal snapshot of a job exactly once.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Called when a job reaches `complete` or `error`.
    async fn job_finished(&self, snapshot: &JobSnapshot) -> anyhow::Result<()>;
}

/// A notifier that discards every event.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl NoopNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for NoopNotifier {
    async fn job_finished(&self, _snapshot: &JobSnapshot) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Logs finished jobs through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn job_finished(&self, snapshot: &JobSnapshot) -> anyhow::Result<()> {
        tracing::info!(
            job_id = %snapshot.job_id,
            status = %snapshot.status,
            completed = snapshot.completed,
            total = snapshot.total,
            failed = snapshot.failed,
            "job finished"
        );
        Ok(())
    }
}
