//! Job-level operations shared by workers, the reclaimer and the HTTP harness.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::store::{FailOutcome, ReclaimReport, TaskError, TaskStore};
use crate::config::PipelineConfig;
use crate::model::{ArtifactRecord, ClaimedTask, JobId, NewJob, TaskId, TaskType};
use crate::notify::Notifier;
use crate::payload::{TaskInput, TaskOutput, TextInput};
use crate::pipeline::PipelineExpander;
use crate::plan::{DocumentPlan, JobRequest};
use crate::progress::{JobSnapshot, ProgressAggregator};

/// Ties the store, the expander and the progress aggregator together.
///
/// Every completion and failure goes through here so downstream expansion
/// and job status follow each task transition.
pub struct Coordinator<S: TaskStore> {
    store: Arc<S>,
    config: PipelineConfig,
    expander: PipelineExpander<S>,
    progress: ProgressAggregator<S>,
    wakeup: Arc<Notify>,
}

impl<S: TaskStore + 'static> Coordinator<S> {
    pub fn new(store: Arc<S>, config: PipelineConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            expander: PipelineExpander::new(store.clone(), config.clone()),
            progress: ProgressAggregator::new(store.clone(), notifier),
            store,
            config,
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn progress(&self) -> &ProgressAggregator<S> {
        &self.progress
    }

    pub fn expander(&self) -> &PipelineExpander<S> {
        &self.expander
    }

    /// Signalled whenever new claimable work appears in this process.
    pub fn wakeup(&self) -> Arc<Notify> {
        self.wakeup.clone()
    }

    fn wake_workers(&self) {
        self.wakeup.notify_waiters();
    }

    /// Validate a request, plan its documents and enqueue their text tasks.
    pub async fn submit(&self, request: JobRequest) -> Result<JobId, TaskError> {
        let plan = DocumentPlan::from_request(&request)
            .map_err(|e| TaskError::InvalidRequest(e.to_string()))?;

        let tasks = plan
            .documents
            .iter()
            .map(|document| {
                let input = TaskInput::Text(TextInput {
                    document: document.clone(),
                    voice: request.voice.clone(),
                });
                self.config.new_task(input, None)
            })
            .collect();

        let job_id = self
            .store
            .create_job(NewJob {
                owner_id: request.owner_id.clone(),
                kind: request.kind,
                expected_tasks: plan.expected_tasks(),
                request,
                tasks,
            })
            .await?;

        info!(
            job_id = %job_id,
            documents = plan.documents.len(),
            expected_tasks = plan.expected_tasks(),
            "job submitted"
        );
        self.wake_workers();
        Ok(job_id)
    }

    pub async fn claim(
        &self,
        task_type: TaskType,
        worker_id: &str,
    ) -> Result<Option<ClaimedTask>, TaskError> {
        let claimed = self.store.claim_next(task_type, worker_id).await?;
        if let Some(task) = &claimed {
            debug!(
                task_id = %task.id,
                job_id = %task.job_id,
                task_type = %task.task_type,
                worker_id,
                attempt = task.attempts,
                "task claimed"
            );
        }
        Ok(claimed)
    }

    pub async fn heartbeat(&self, task_id: TaskId, worker_id: &str) -> Result<bool, TaskError> {
        self.store.heartbeat(task_id, worker_id).await
    }

    /// Record a finished task, insert its downstream stages and refresh the job.
    ///
    /// Returns false when the worker no longer owned the task.
    pub async fn complete(
        &self,
        task: &ClaimedTask,
        output: &TaskOutput,
    ) -> Result<bool, TaskError> {
        if output.task_type() != task.task_type {
            let error = format!(
                "producer returned {} output for a {} task",
                output.task_type(),
                task.task_type
            );
            self.fail(task, &error, false).await?;
            return Ok(false);
        }

        if !self.store.complete(task.id, &task.worker_id, output).await? {
            warn!(
                task_id = %task.id,
                worker_id = %task.worker_id,
                "completion discarded, task no longer owned"
            );
            return Ok(false);
        }
        info!(task_id = %task.id, job_id = %task.job_id, task_type = %task.task_type, "task complete");

        match self.expander.on_task_complete(task.id).await {
            Ok(created) if !created.is_empty() => self.wake_workers(),
            Ok(_) => {}
            // The reclaimer's repair pass picks this up later.
            Err(e) => warn!(task_id = %task.id, error = %e, "expansion failed"),
        }

        self.progress.refresh_job(task.job_id).await?;
        Ok(true)
    }

    /// Record a failed attempt. `None` when the worker no longer owned the task.
    pub async fn fail(
        &self,
        task: &ClaimedTask,
        error: &str,
        retryable: bool,
    ) -> Result<Option<FailOutcome>, TaskError> {
        let outcome = self
            .store
            .fail(task.id, &task.worker_id, error, retryable)
            .await?;

        match &outcome {
            Some(o) if o.is_terminal() => {
                warn!(
                    task_id = %task.id,
                    job_id = %task.job_id,
                    attempts = o.attempts,
                    max_attempts = o.max_attempts,
                    error,
                    "task failed"
                );
                self.progress.refresh_job(o.job_id).await?;
            }
            Some(o) => {
                info!(
                    task_id = %task.id,
                    attempts = o.attempts,
                    max_attempts = o.max_attempts,
                    error,
                    "task will be retried"
                );
                self.wake_workers();
            }
            None => warn!(task_id = %task.id, "failure discarded, task no longer owned"),
        }
        Ok(outcome)
    }

    /// Sweep stale tasks and refresh the jobs whose tasks failed for good.
    pub async fn reclaim_stale(&self, now: DateTime<Utc>) -> Result<ReclaimReport, TaskError> {
        let report = self
            .store
            .reclaim_stale(now, &self.config.grace_periods())
            .await?;

        let jobs: BTreeSet<JobId> = report.failed.iter().map(|(_, job)| *job).collect();
        for job_id in jobs {
            self.progress.refresh_job(job_id).await?;
        }
        if !report.reset.is_empty() {
            self.wake_workers();
        }
        Ok(report)
    }

    /// Expand completed tasks that were never expanded.
    pub async fn repair_expansions(&self, limit: usize) -> Result<Vec<TaskId>, TaskError> {
        let created = self.expander.expand_missing(limit).await?;
        if !created.is_empty() {
            self.wake_workers();
        }
        Ok(created)
    }

    pub async fn snapshot(&self, job_id: JobId) -> Result<JobSnapshot, TaskError> {
        self.progress.snapshot(job_id).await
    }

    pub async fn artifacts(&self, job_id: JobId) -> Result<Vec<ArtifactRecord>, TaskError> {
        self.store.artifacts_for_job(job_id).await
    }

    /// Cancel a live job. Queued tasks stop being claimable; running ones finish.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, TaskError> {
        let cancelled = self.store.cancel_job(job_id).await?;
        if cancelled {
            info!(job_id = %job_id, "job cancelled");
        }
        Ok(cancelled)
    }

    /// Put a processing task back to pending.
    pub async fn reset_task(&self, task_id: TaskId) -> Result<bool, TaskError> {
        let reset = self.store.reset_task(task_id).await?;
        if reset {
            info!(task_id = %task_id, "task reset by hand");
            self.wake_workers();
        }
        Ok(reset)
    }
}
