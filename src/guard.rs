//! Fail-fast handling of worker faults.
//!
//! A panic inside a unit of work means the worker's state can no longer be
//! trusted. Instead of leaving the held task in `processing` until the
//! reclaimer notices, the guard fails it immediately, moves the job to
//! `error`, notifies, and tells the worker to stop.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{error, warn};

use crate::model::{ClaimedTask, JobId, TaskId, TaskType};
use crate::runner::coordinator::Coordinator;
use crate::runner::store::{TaskError, TaskStore};

/// Error that ends a worker's run loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] TaskError),

    #[error("worker fault while holding task {task_id:?}: {message}")]
    Fatal {
        task_id: Option<TaskId>,
        message: String,
    },
}

/// A task the worker currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldTask {
    pub job_id: JobId,
    pub task_type: TaskType,
    pub attempt: u32,
}

/// The tasks one worker is holding right now.
///
/// Each worker owns its own context; it is set at claim and cleared when the
/// task is completed or failed.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    worker_id: String,
    held: Arc<Mutex<HashMap<TaskId, HeldTask>>>,
}

impl WorkerContext {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            held: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, HeldTask>> {
        // A panic while holding the lock leaves the map itself intact.
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn hold(&self, task: &ClaimedTask) {
        self.lock().insert(
            task.id,
            HeldTask {
                job_id: task.job_id,
                task_type: task.task_type,
                attempt: task.attempts,
            },
        );
    }

    pub fn release(&self, task_id: TaskId) -> Option<HeldTask> {
        self.lock().remove(&task_id)
    }

    pub fn held(&self) -> Vec<(TaskId, HeldTask)> {
        let mut held: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, task)| (*id, task.clone()))
            .collect();
        held.sort_by_key(|(id, _)| *id);
        held
    }

    pub fn is_idle(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Marks held work failed when a worker faults.
pub struct CrashGuard<S: TaskStore> {
    coordinator: Arc<Coordinator<S>>,
}

impl<S: TaskStore> Clone for CrashGuard<S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
        }
    }
}

impl<S: TaskStore + 'static> CrashGuard<S> {
    pub fn new(coordinator: Arc<Coordinator<S>>) -> Self {
        Self { coordinator }
    }

    /// Log every panic through `tracing`, then run the previous hook.
    ///
    /// Call once at process start, after the subscriber is installed.
    pub fn install_panic_hook() {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_else(|| "unknown".to_string());
            let thread = std::thread::current();
            error!(
                panic = %panic_message(info.payload()),
                location = %location,
                thread = thread.name().unwrap_or("unnamed"),
                "worker panicked"
            );
            previous(info);
        }));
    }

    /// Fail one held task and its job after a fault.
    ///
    /// Only a task this worker still owns is touched. If it was reclaimed and
    /// handed to another worker in the meantime, that worker's run stands.
    ///
    /// Always returns the `Fatal` error the worker must stop with; store
    /// errors while recording the fault are logged, since the reclaimer
    /// still recovers the task later.
    pub async fn handle_fault(
        &self,
        context: &WorkerContext,
        task_id: TaskId,
        job_id: JobId,
        message: &str,
    ) -> WorkerError {
        context.release(task_id);
        let description = format!("worker {} fault: {}", context.worker_id(), message);

        error!(
            task_id = %task_id,
            job_id = %job_id,
            worker_id = context.worker_id(),
            fault = message,
            "worker fault, failing held task and job"
        );

        if let Err(e) = self
            .record(context.worker_id(), task_id, job_id, &description)
            .await
        {
            error!(task_id = %task_id, error = %e, "could not record worker fault");
        }

        WorkerError::Fatal {
            task_id: Some(task_id),
            message: message.to_string(),
        }
    }

    /// Fail every task the context still holds. Used when the faulting unit
    /// cannot be identified.
    pub async fn handle_unattributed(&self, context: &WorkerContext, message: &str) -> WorkerError {
        let held = context.held();
        let first = held.first().map(|(id, _)| *id);
        for (task_id, task) in held {
            let _ = self
                .handle_fault(context, task_id, task.job_id, message)
                .await;
        }
        WorkerError::Fatal {
            task_id: first,
            message: message.to_string(),
        }
    }

    async fn record(
        &self,
        worker_id: &str,
        task_id: TaskId,
        job_id: JobId,
        description: &str,
    ) -> Result<(), TaskError> {
        let store = self.coordinator.store();
        if store
            .force_fail(task_id, worker_id, description)
            .await?
            .is_none()
        {
            warn!(
                task_id = %task_id,
                worker_id,
                "faulted task is no longer owned, leaving it and its job alone"
            );
            return Ok(());
        }

        let summary = format!("processing aborted by a worker fault on task {task_id}");
        if store.fail_job(job_id, &summary).await? {
            let snapshot = self.coordinator.progress().snapshot(job_id).await?;
            self.coordinator.progress().announce(&snapshot).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{TaskInput, TextInput};
    use crate::plan::{Document, Person, Subject};
    use chrono::Utc;
    use std::time::Duration;

    fn claimed(id: i64) -> ClaimedTask {
        ClaimedTask {
            id: TaskId(id),
            job_id: JobId(1),
            task_type: TaskType::TextGeneration,
            sequence: 1,
            source_task_id: None,
            input: TaskInput::Text(TextInput {
                document: Document {
                    number: 1,
                    system: None,
                    title: "t".into(),
                    subject: Subject::Person {
                        person: Person::new("Ada"),
                    },
                },
                voice: None,
            }),
            attempts: 1,
            max_attempts: 3,
            worker_id: "w".into(),
            claimed_at: Utc::now(),
            heartbeat_timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn context_tracks_held_tasks() {
        let context = WorkerContext::new("w");
        assert!(context.is_idle());

        context.hold(&claimed(2));
        context.hold(&claimed(1));
        let held: Vec<_> = context.held().into_iter().map(|(id, _)| id).collect();
        assert_eq!(held, vec![TaskId(1), TaskId(2)]);

        assert_eq!(context.release(TaskId(1)).map(|t| t.attempt), Some(1));
        assert_eq!(context.release(TaskId(1)), None);
        assert!(!context.is_idle());
    }

    #[test]
    fn panic_payloads_become_text() {
        let from_str: Box<dyn Any + Send> = Box::new("boom");
        let from_string: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(from_str.as_ref()), "boom");
        assert_eq!(panic_message(from_string.as_ref()), "bang");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
