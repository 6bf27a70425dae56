//! Job progress aggregation.
//!
//! A job's status is derived from its tasks. [`aggregate`] is the pure
//! derivation; [`ProgressAggregator`] persists it and fires the notifier
//! when a job lands on a terminal status.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::model::{JobId, JobRecord, JobStatus, TaskId, TaskRecord, TaskStatus, TaskType};
use crate::notify::Notifier;
use crate::pipeline::has_downstream;
use crate::runner::store::{TaskError, TaskStore};

/// Coarse description of where a job is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Queued,
    GeneratingText,
    RenderingMedia,
    ComposingSongs,
    Complete,
    Error,
    Cancelled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Queued => "queued",
            Phase::GeneratingText => "generating_text",
            Phase::RenderingMedia => "rendering_media",
            Phase::ComposingSongs => "composing_songs",
            Phase::Complete => "complete",
            Phase::Error => "error",
            Phase::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One task as it appears in a job snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub task_type: TaskType,
    pub sequence: u32,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error: Option<String>,
}

/// Point-in-time view of a job derived from its tasks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    pub phase: Phase,
    pub percent: u32,
    pub message: String,
    pub completed: u32,
    pub total: u32,
    pub failed: u32,
    pub error: Option<String>,
    pub tasks: Vec<TaskSummary>,
}

/// Derive a job's status and progress from its tasks.
///
/// `total` never drops below the number of tasks the job was planned with,
/// so a job whose downstream stages are not yet inserted cannot look done.
/// A completed task still waiting for its downstream insert counts as in
/// flight, so a failure elsewhere cannot end the job under it.
pub fn aggregate(job: &JobRecord, tasks: &[TaskRecord]) -> JobSnapshot {
    let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count() as u32;
    let completed = count(TaskStatus::Complete);
    let failed = count(TaskStatus::Failed);
    let awaiting_expansion = tasks
        .iter()
        .filter(|t| {
            t.status == TaskStatus::Complete
                && has_downstream(t)
                && !tasks.iter().any(|d| d.source_task_id == Some(t.id))
        })
        .count() as u32;
    let in_flight =
        count(TaskStatus::Pending) + count(TaskStatus::Processing) + awaiting_expansion;
    let total = job.expected_tasks.max(tasks.len() as u32);
    let percent = if total == 0 { 0 } else { completed * 100 / total };

    let status = if job.status.is_terminal() {
        job.status
    } else if !tasks.is_empty() && completed == total {
        JobStatus::Complete
    } else if failed > 0 && in_flight == 0 {
        JobStatus::Error
    } else if job.status == JobStatus::Processing
        || tasks
            .iter()
            .any(|t| t.attempts > 0 || t.status != TaskStatus::Pending)
    {
        JobStatus::Processing
    } else {
        JobStatus::Queued
    };

    let phase = match status {
        JobStatus::Queued => Phase::Queued,
        JobStatus::Complete => Phase::Complete,
        JobStatus::Error => Phase::Error,
        JobStatus::Cancelled => Phase::Cancelled,
        JobStatus::Processing => working_phase(tasks),
    };

    let error = match status {
        JobStatus::Error => job.error.clone().or_else(|| first_failure(tasks)),
        _ => None,
    };

    let message = match status {
        JobStatus::Queued => "waiting for a worker".to_string(),
        JobStatus::Processing => format!("{completed} of {total} tasks complete"),
        JobStatus::Complete => format!("all {total} tasks complete"),
        JobStatus::Error => format!("{failed} failed, {completed} of {total} tasks complete"),
        JobStatus::Cancelled => "cancelled".to_string(),
    };

    let mut summaries: Vec<TaskSummary> = tasks
        .iter()
        .map(|t| TaskSummary {
            id: t.id,
            task_type: t.task_type,
            sequence: t.sequence,
            status: t.status,
            attempts: t.attempts,
            max_attempts: t.max_attempts,
            error: t.error.clone(),
        })
        .collect();
    summaries.sort_by_key(|t| (t.sequence, t.id));

    JobSnapshot {
        job_id: job.id,
        status,
        phase,
        percent,
        message,
        completed,
        total,
        failed,
        error,
        tasks: summaries,
    }
}

/// The earliest stage that still has unfinished work.
fn working_phase(tasks: &[TaskRecord]) -> Phase {
    let unfinished = |task_type: TaskType| {
        tasks
            .iter()
            .any(|t| t.task_type == task_type && !t.status.is_terminal())
    };
    if tasks.is_empty() || unfinished(TaskType::TextGeneration) {
        Phase::GeneratingText
    } else if unfinished(TaskType::PdfGeneration) || unfinished(TaskType::AudioGeneration) {
        Phase::RenderingMedia
    } else if unfinished(TaskType::SongGeneration) {
        Phase::ComposingSongs
    } else {
        // Everything present is done; waiting on expansion.
        Phase::RenderingMedia
    }
}

fn first_failure(tasks: &[TaskRecord]) -> Option<String> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .min_by_key(|t| (t.sequence, t.id))
        .map(|t| {
            let reason = t.error.as_deref().unwrap_or("unknown error");
            format!("{} for document {}: {}", t.task_type, t.sequence, reason)
        })
}

/// Reads, persists and announces job progress.
pub struct ProgressAggregator<S: TaskStore> {
    store: Arc<S>,
    notifier: Arc<dyn Notifier>,
}

impl<S: TaskStore> Clone for ProgressAggregator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

impl<S: TaskStore + 'static> ProgressAggregator<S> {
    pub fn new(store: Arc<S>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Current snapshot without writing anything.
    pub async fn snapshot(&self, job_id: JobId) -> Result<JobSnapshot, TaskError> {
        let job = self
            .store
            .job(job_id)
            .await?
            .ok_or(TaskError::JobNotFound(job_id))?;
        let tasks = self.store.tasks_for_job(job_id).await?;
        Ok(aggregate(&job, &tasks))
    }

    /// Persist the derived progress of a job.
    ///
    /// When this call moves the job to a terminal status the notifier is
    /// invoked; concurrent refreshes of the same job notify once between them.
    pub async fn refresh_job(&self, job_id: JobId) -> Result<JobSnapshot, TaskError> {
        let job = self
            .store
            .job(job_id)
            .await?
            .ok_or(TaskError::JobNotFound(job_id))?;
        let tasks = self.store.tasks_for_job(job_id).await?;
        let snapshot = aggregate(&job, &tasks);

        if job.status.is_terminal() {
            return Ok(snapshot);
        }

        if self.store.record_progress(job_id, &snapshot).await? {
            info!(
                job_id = %job_id,
                status = %snapshot.status,
                completed = snapshot.completed,
                total = snapshot.total,
                "job reached terminal status"
            );
            self.announce(&snapshot).await;
        }
        Ok(snapshot)
    }

    /// Hand a terminal snapshot to the notifier. Delivery errors are logged.
    pub async fn announce(&self, snapshot: &JobSnapshot) {
        if let Err(e) = self.notifier.job_finished(snapshot).await {
            warn!(job_id = %snapshot.job_id, error = %e, "notifier failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobKind;
    use crate::payload::{TaskInput, TextInput};
    use crate::plan::{Document, JobOptions, JobRequest, Person, Subject, System};
    use chrono::Utc;

    fn job(status: JobStatus, expected: u32) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id: JobId(1),
            owner_id: "u".into(),
            kind: JobKind::Individual,
            request: JobRequest {
                owner_id: "u".into(),
                kind: JobKind::Individual,
                people: vec![Person::new("Ada")],
                systems: vec![System::Western],
                voice: None,
                options: JobOptions::default(),
            },
            status,
            phase: "queued".into(),
            message: None,
            percent: 0,
            completed_tasks: 0,
            expected_tasks: expected,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn task(id: i64, task_type: TaskType, status: TaskStatus) -> TaskRecord {
        let now = Utc::now();
        TaskRecord {
            id: TaskId(id),
            job_id: JobId(1),
            task_type,
            sequence: 1,
            source_task_id: None,
            status,
            input: TaskInput::Text(TextInput {
                document: Document {
                    number: 1,
                    system: Some(System::Western),
                    title: "Western Astrology: Ada".into(),
                    subject: Subject::Person {
                        person: Person::new("Ada"),
                    },
                },
                voice: None,
            }),
            output: None,
            attempts: u32::from(status != TaskStatus::Pending),
            max_attempts: 3,
            worker_id: None,
            claimed_at: None,
            last_heartbeat: None,
            heartbeat_timeout_secs: 120,
            error: (status == TaskStatus::Failed).then(|| "boom".to_string()),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    #[test]
    fn fresh_job_is_queued() {
        let snap = aggregate(
            &job(JobStatus::Queued, 3),
            &[task(1, TaskType::TextGeneration, TaskStatus::Pending)],
        );
        assert_eq!(snap.status, JobStatus::Queued);
        assert_eq!(snap.total, 3);
        assert_eq!(snap.percent, 0);
    }

    #[test]
    fn completed_text_without_downstream_is_not_complete() {
        let snap = aggregate(
            &job(JobStatus::Processing, 3),
            &[task(1, TaskType::TextGeneration, TaskStatus::Complete)],
        );
        assert_eq!(snap.status, JobStatus::Processing);
        assert_eq!(snap.percent, 33);
        assert_eq!(snap.phase, Phase::RenderingMedia);
    }

    #[test]
    fn all_expected_tasks_complete_means_complete() {
        let tasks = [
            task(1, TaskType::TextGeneration, TaskStatus::Complete),
            task(2, TaskType::PdfGeneration, TaskStatus::Complete),
            task(3, TaskType::AudioGeneration, TaskStatus::Complete),
        ];
        let snap = aggregate(&job(JobStatus::Processing, 3), &tasks);
        assert_eq!(snap.status, JobStatus::Complete);
        assert_eq!(snap.percent, 100);
        assert_eq!(snap.phase, Phase::Complete);
    }

    #[test]
    fn failure_waits_for_in_flight_work() {
        let mut tasks = vec![
            task(1, TaskType::TextGeneration, TaskStatus::Failed),
            task(2, TaskType::TextGeneration, TaskStatus::Processing),
        ];
        let running = aggregate(&job(JobStatus::Processing, 6), &tasks);
        assert_eq!(running.status, JobStatus::Processing);
        assert_eq!(running.failed, 1);

        // The surviving document has not been expanded yet.
        tasks[1].status = TaskStatus::Complete;
        let expanding = aggregate(&job(JobStatus::Processing, 6), &tasks);
        assert_eq!(expanding.status, JobStatus::Processing);

        for (id, task_type) in [(3, TaskType::PdfGeneration), (4, TaskType::AudioGeneration)] {
            let mut child = task(id, task_type, TaskStatus::Complete);
            child.source_task_id = Some(TaskId(2));
            tasks.push(child);
        }
        let done = aggregate(&job(JobStatus::Processing, 6), &tasks);
        assert_eq!(done.status, JobStatus::Error);
        assert_eq!(
            done.error.as_deref(),
            Some("text_generation for document 1: boom")
        );
    }

    #[test]
    fn stored_terminal_status_wins() {
        let snap = aggregate(
            &job(JobStatus::Cancelled, 3),
            &[task(1, TaskType::TextGeneration, TaskStatus::Pending)],
        );
        assert_eq!(snap.status, JobStatus::Cancelled);
        assert_eq!(snap.phase, Phase::Cancelled);
    }
}
