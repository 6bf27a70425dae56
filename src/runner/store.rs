//! Task storage trait and types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::model::{
    ArtifactRecord, ClaimedTask, JobId, JobRecord, NewJob, NewTask, TaskId, TaskRecord,
    TaskStatus, TaskType,
};
use crate::payload::TaskOutput;
use crate::progress::JobSnapshot;

/// Longest error string written to a task or job row.
pub const MAX_ERROR_LEN: usize = 2000;

/// Error type for task operations.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("storage error: {0}")]
    StorageError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("deserialization error: {0}")]
    DeserializationError(String),

    #[error("no producer registered for task type: {0}")]
    UnknownTaskType(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("producer error: {0}")]
    ProducerError(String),
}

/// Cut an error message to [`MAX_ERROR_LEN`] bytes without splitting a character.
pub fn truncate_error(error: &str) -> &str {
    if error.len() <= MAX_ERROR_LEN {
        return error;
    }
    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    &error[..end]
}

/// What an explicit failure did to the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailOutcome {
    pub job_id: JobId,
    /// `Pending` when the task will be retried, `Failed` when it is done.
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl FailOutcome {
    pub fn is_terminal(&self) -> bool {
        self.status == TaskStatus::Failed
    }
}

/// Why an expansion inserted nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The job is cancelled or already terminal.
    JobInactive,
    /// The upstream task has not completed.
    UpstreamNotComplete,
}

/// Result of inserting downstream tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    Inserted {
        created: Vec<TaskId>,
        /// Tasks that an earlier expansion of the same source already inserted.
        existing: Vec<TaskId>,
    },
    Skipped(SkipReason),
}

impl Expansion {
    /// Ids of the tasks this call created.
    pub fn created(&self) -> &[TaskId] {
        match self {
            Expansion::Inserted { created, .. } => created,
            Expansion::Skipped(_) => &[],
        }
    }
}

/// Outcome of one stale-task sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Tasks put back to `pending`.
    pub reset: Vec<TaskId>,
    /// Tasks failed for good, with their job.
    pub failed: Vec<(TaskId, JobId)>,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.reset.is_empty() && self.failed.is_empty()
    }
}

/// How long a claimed task may go without its first heartbeat.
///
/// Unset task types default to twice their heartbeat timeout.
#[derive(Debug, Clone, Default)]
pub struct GracePeriods {
    overrides: HashMap<TaskType, Duration>,
}

impl GracePeriods {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the grace period for one task type.
    pub fn with(mut self, task_type: TaskType, grace: Duration) -> Self {
        self.overrides.insert(task_type, grace);
        self
    }

    pub fn for_task(&self, task_type: TaskType, heartbeat_timeout: Duration) -> Duration {
        self.overrides
            .get(&task_type)
            .copied()
            .unwrap_or(heartbeat_timeout * 2)
    }
}

/// Trait for task storage backends.
///
/// Every state transition is a conditional update: it only applies while the
/// row is still in the state the caller observed, so any number of workers
/// and sweepers can share one store.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a job and its first-stage tasks in one transaction.
    async fn create_job(&self, job: NewJob) -> Result<JobId, TaskError>;

    async fn job(&self, id: JobId) -> Result<Option<JobRecord>, TaskError>;

    async fn task(&self, id: TaskId) -> Result<Option<TaskRecord>, TaskError>;

    /// All tasks of a job, in claim order.
    async fn tasks_for_job(&self, id: JobId) -> Result<Vec<TaskRecord>, TaskError>;

    async fn artifacts_for_job(&self, id: JobId) -> Result<Vec<ArtifactRecord>, TaskError>;

    /// Claim the oldest eligible pending task of a type.
    ///
    /// `None` means there was nothing to claim or another worker won the race.
    async fn claim_next(
        &self,
        task_type: TaskType,
        worker_id: &str,
    ) -> Result<Option<ClaimedTask>, TaskError>;

    /// Record liveness. Returns false once the caller no longer owns the task.
    async fn heartbeat(&self, id: TaskId, worker_id: &str) -> Result<bool, TaskError>;

    /// Mark an owned task complete and record its artifact.
    ///
    /// Returns false when the caller lost ownership; nothing is written then.
    async fn complete(
        &self,
        id: TaskId,
        worker_id: &str,
        output: &TaskOutput,
    ) -> Result<bool, TaskError>;

    /// Fail an owned task. Retryable failures with attempts left go back to
    /// `pending`; everything else is final. `None` when ownership was lost.
    async fn fail(
        &self,
        id: TaskId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<Option<FailOutcome>, TaskError>;

    /// Fail an owned processing task regardless of remaining attempts.
    ///
    /// `None` when `worker_id` no longer holds the task, e.g. after it was
    /// reclaimed and claimed by another worker.
    async fn force_fail(
        &self,
        id: TaskId,
        worker_id: &str,
        error: &str,
    ) -> Result<Option<JobId>, TaskError>;

    /// Move a live job to `error`. True only for the caller that made the move.
    async fn fail_job(&self, id: JobId, error: &str) -> Result<bool, TaskError>;

    /// Move a live job to `cancelled`.
    async fn cancel_job(&self, id: JobId) -> Result<bool, TaskError>;

    /// Insert the downstream tasks of a completed task, ignoring ones that exist.
    async fn expand(&self, source: TaskId, tasks: Vec<NewTask>) -> Result<Expansion, TaskError>;

    /// Completed text tasks, and audio tasks bound for a song, of live jobs
    /// that have no downstream task yet.
    async fn unexpanded_tasks(&self, limit: usize) -> Result<Vec<TaskRecord>, TaskError>;

    /// Reset or fail every processing task whose owner has gone quiet.
    async fn reclaim_stale(
        &self,
        now: DateTime<Utc>,
        grace: &GracePeriods,
    ) -> Result<ReclaimReport, TaskError>;

    /// Put a processing task back to `pending` by hand.
    async fn reset_task(&self, id: TaskId) -> Result<bool, TaskError>;

    /// Persist derived progress.
    ///
    /// Returns true only when this call moved the job to a terminal status.
    async fn record_progress(&self, id: JobId, snapshot: &JobSnapshot) -> Result<bool, TaskError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let short = "provider timed out";
        assert_eq!(truncate_error(short), short);

        // 'é' is two bytes, so byte 2000 lands mid-character.
        let long = format!("x{}", "é".repeat(1500));
        let cut = truncate_error(&long);
        assert!(cut.len() <= MAX_ERROR_LEN);
        assert_eq!(cut.len(), 1999);
        assert!(long.starts_with(cut));
    }

    #[test]
    fn grace_defaults_to_twice_the_timeout() {
        let grace = GracePeriods::new().with(TaskType::SongGeneration, Duration::from_secs(30));
        assert_eq!(
            grace.for_task(TaskType::TextGeneration, Duration::from_secs(120)),
            Duration::from_secs(240)
        );
        assert_eq!(
            grace.for_task(TaskType::SongGeneration, Duration::from_secs(600)),
            Duration::from_secs(30)
        );
    }
}
