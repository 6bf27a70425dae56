//! Content producer trait and error types.
//!
//! A producer is the external call behind a stage: the LLM for text, the
//! speech engine for audio, the renderer for PDFs, the synthesizer for songs.
//! The pipeline only sees `invoke(task) -> output | error`.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{ClaimedTask, TaskType};
use crate::payload::TaskOutput;

/// Error returned by a producer.
#[derive(Error, Debug)]
pub enum ProducerError {
    /// Transient failure: timeout, rate limit, upstream hiccup.
    #[error("retryable: {0}")]
    Retryable(#[source] anyhow::Error),

    /// Permanent failure: retrying the same input will not help.
    #[error("permanent: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl ProducerError {
    /// Create a retryable error.
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    /// Create a permanent error.
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// The external call that does the work of one stage.
///
/// Producers may be invoked more than once for the same task (a reclaimed
/// task is processed again), so artifact writes should be keyed by task id.
#[async_trait]
pub trait Producer: Send + Sync {
    /// The stage this producer serves.
    fn task_type(&self) -> TaskType;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        self.task_type().as_str()
    }

    /// Produce the output for a claimed task.
    async fn invoke(&self, task: &ClaimedTask) -> Result<TaskOutput, ProducerError>;
}
