//! Worker that polls for tasks and dispatches them to producers.

use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::coordinator::Coordinator;
use super::heartbeat::HeartbeatEmitter;
use super::store::{TaskError, TaskStore};
use crate::config::{StageConfig, WorkerConfig};
use crate::guard::{panic_message, CrashGuard, WorkerContext, WorkerError};
use crate::model::{ClaimedTask, TaskType};
use crate::producer::Producer;

struct Lane {
    producer: Arc<dyn Producer>,
    stage: StageConfig,
    permits: Arc<Semaphore>,
}

/// A worker that claims tasks of its registered types and runs them.
pub struct Worker<S: TaskStore> {
    coordinator: Arc<Coordinator<S>>,
    lanes: Vec<(TaskType, Lane)>,
    context: WorkerContext,
    guard: CrashGuard<S>,
    poll_interval: Duration,
}

impl<S: TaskStore + 'static> Worker<S> {
    pub fn worker_id(&self) -> &str {
        self.context.worker_id()
    }

    pub fn context(&self) -> &WorkerContext {
        &self.context
    }

    /// Poll until `shutdown` fires, then wait for in-flight tasks.
    ///
    /// Returns `WorkerError::Fatal` as soon as a unit of work panics; the
    /// worker must not be run again after that.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        info!(
            worker_id = self.worker_id(),
            task_types = ?self.lanes.iter().map(|(t, _)| t.as_str()).collect::<Vec<_>>(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "worker started"
        );

        let wakeup = self.coordinator.wakeup();
        let mut units: JoinSet<Result<(), WorkerError>> = JoinSet::new();

        let result = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }

            let mut fault = None;
            while let Some(joined) = units.try_join_next() {
                if let Err(fatal) = self.settle(joined).await {
                    fault = Some(fatal);
                    break;
                }
            }
            if let Some(fatal) = fault {
                break Err(fatal);
            }

            let claimed = match self.claim_into(&mut units).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(worker_id = self.worker_id(), error = %e, "claim failed");
                    0
                }
            };
            if claimed > 0 {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = wakeup.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                Some(joined) = units.join_next(), if !units.is_empty() => {
                    if let Err(fatal) = self.settle(joined).await {
                        break Err(fatal);
                    }
                }
            }
        };

        match result {
            Ok(()) => {
                info!(worker_id = self.worker_id(), in_flight = units.len(), "worker draining");
                while let Some(joined) = units.join_next().await {
                    self.settle(joined).await?;
                }
                info!(worker_id = self.worker_id(), "worker stopped");
                Ok(())
            }
            Err(fatal) => {
                // Fail-fast: the remaining units run in an untrusted process.
                units.shutdown().await;
                error!(worker_id = self.worker_id(), error = %fatal, "worker stopped after fault");
                Err(fatal)
            }
        }
    }

    /// [`run`](Self::run) for a process that hosts workers: a fault ends the
    /// whole process with exit status 1 once the held task and job are failed.
    pub async fn run_or_exit(&self, shutdown: CancellationToken) {
        if let Err(e) = self.run(shutdown).await {
            error!(worker_id = self.worker_id(), error = %e, "terminating after worker fault");
            std::process::exit(1);
        }
    }

    /// Claim and run whatever is available, waiting for every unit to finish.
    ///
    /// Returns the number of tasks processed.
    pub async fn run_once(&self) -> Result<usize, WorkerError> {
        let mut units = JoinSet::new();
        let claimed = self.claim_into(&mut units).await?;
        while let Some(joined) = units.join_next().await {
            self.settle(joined).await?;
        }
        Ok(claimed)
    }

    /// Run until no task of any registered type can be claimed.
    pub async fn drain(&self) -> Result<usize, WorkerError> {
        let mut total = 0;
        loop {
            let processed = self.run_once().await?;
            if processed == 0 {
                return Ok(total);
            }
            total += processed;
        }
    }

    /// Claim one task per lane with a free permit and spawn it.
    async fn claim_into(
        &self,
        units: &mut JoinSet<Result<(), WorkerError>>,
    ) -> Result<usize, TaskError> {
        let mut claimed = 0;
        for (task_type, lane) in &self.lanes {
            let Ok(permit) = lane.permits.clone().try_acquire_owned() else {
                continue;
            };
            let Some(task) = self.coordinator.claim(*task_type, self.worker_id()).await? else {
                continue;
            };

            self.context.hold(&task);
            units.spawn(process(
                self.coordinator.clone(),
                lane.producer.clone(),
                lane.stage.clone(),
                self.context.clone(),
                self.guard.clone(),
                task,
                permit,
            ));
            claimed += 1;
        }
        Ok(claimed)
    }

    async fn settle(
        &self,
        joined: Result<Result<(), WorkerError>, JoinError>,
    ) -> Result<(), WorkerError> {
        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic().as_ref());
                Err(self.guard.handle_unattributed(&self.context, &message).await)
            }
            Err(e) => {
                debug!(worker_id = self.worker_id(), error = %e, "unit cancelled");
                Ok(())
            }
        }
    }
}

/// One unit of work: heartbeat, invoke, then complete or fail.
async fn process<S: TaskStore + 'static>(
    coordinator: Arc<Coordinator<S>>,
    producer: Arc<dyn Producer>,
    stage: StageConfig,
    context: WorkerContext,
    guard: CrashGuard<S>,
    task: ClaimedTask,
    permit: OwnedSemaphorePermit,
) -> Result<(), WorkerError> {
    debug!(
        task_id = %task.id,
        job_id = %task.job_id,
        producer = producer.name(),
        attempt = task.attempts,
        "processing task"
    );

    let heartbeat = HeartbeatEmitter::start(
        coordinator.store().clone(),
        task.id,
        task.worker_id.clone(),
        stage.heartbeat_interval,
    );

    let invocation = tokio::time::timeout(
        stage.processing_timeout,
        stage.provider_retry.run(|| producer.invoke(&task)),
    );
    let outcome = AssertUnwindSafe(invocation).catch_unwind().await;

    heartbeat.stop().await;

    let settled = match outcome {
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            drop(permit);
            return Err(guard.handle_fault(&context, task.id, task.job_id, &message).await);
        }
        Ok(Err(_elapsed)) => {
            let error = format!(
                "{} timed out after {}s",
                producer.name(),
                stage.processing_timeout.as_secs()
            );
            coordinator.fail(&task, &error, true).await.map(|_| ())
        }
        Ok(Ok(Ok(output))) => coordinator.complete(&task, &output).await.map(|_| ()),
        Ok(Ok(Err(e))) => coordinator
            .fail(&task, &e.to_string(), e.is_retryable())
            .await
            .map(|_| ()),
    };

    context.release(task.id);
    drop(permit);

    // The task stays processing; the reclaimer recovers it.
    if let Err(e) = settled {
        error!(task_id = %task.id, error = %e, "could not record task outcome");
    }
    Ok(())
}

fn generated_worker_id() -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!("worker-{}-{}", std::process::id(), &token[..8])
}

/// Builder for constructing a Worker.
pub struct WorkerBuilder<S: TaskStore> {
    coordinator: Arc<Coordinator<S>>,
    lanes: HashMap<TaskType, (Arc<dyn Producer>, Option<usize>)>,
    config: WorkerConfig,
}

impl<S: TaskStore + 'static> WorkerBuilder<S> {
    /// Create a new builder around a shared coordinator.
    pub fn new(coordinator: Arc<Coordinator<S>>) -> Self {
        Self {
            coordinator,
            lanes: HashMap::new(),
            config: WorkerConfig::default(),
        }
    }

    /// Register a producer for its task type, using the stage's concurrency.
    pub fn producer(mut self, producer: impl Producer + 'static) -> Self {
        self.lanes
            .insert(producer.task_type(), (Arc::new(producer), None));
        self
    }

    /// Register a producer with its own concurrency limit.
    pub fn producer_with_concurrency(
        mut self,
        producer: impl Producer + 'static,
        concurrency: usize,
    ) -> Self {
        self.lanes.insert(
            producer.task_type(),
            (Arc::new(producer), Some(concurrency.max(1))),
        );
        self
    }

    /// Set the poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.config.worker_id = Some(worker_id.into());
        self
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the worker.
    pub fn build(self) -> Worker<S> {
        let pipeline = self.coordinator.config().clone();
        let mut lanes: Vec<(TaskType, Lane)> = self
            .lanes
            .into_iter()
            .map(|(task_type, (producer, concurrency))| {
                let stage = pipeline.stage(task_type);
                let permits = concurrency.unwrap_or(stage.concurrency).max(1);
                (
                    task_type,
                    Lane {
                        producer,
                        stage,
                        permits: Arc::new(Semaphore::new(permits)),
                    },
                )
            })
            .collect();
        lanes.sort_by_key(|(task_type, _)| *task_type);

        Worker {
            guard: CrashGuard::new(self.coordinator.clone()),
            coordinator: self.coordinator,
            lanes,
            context: WorkerContext::new(
                self.config.worker_id.unwrap_or_else(generated_worker_id),
            ),
            poll_interval: self.config.poll_interval,
        }
    }
}
