//! A panicking producer takes its task and job down with it.

mod common;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::{individual, output_for, setup, StubProducer};
use readingflow::{
    ClaimedTask, CrashGuard, JobStatus, PipelineConfig, Producer, ProducerError, System,
    TaskOutput, TaskStatus, TaskStore, TaskType, WorkerBuilder, WorkerContext, WorkerError,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Exploding;

#[async_trait]
impl Producer for Exploding {
    fn task_type(&self) -> TaskType {
        TaskType::AudioGeneration
    }

    async fn invoke(&self, _task: &ClaimedTask) -> Result<TaskOutput, ProducerError> {
        panic!("synthesizer exploded");
    }
}

#[tokio::test]
async fn test_panic_fails_task_and_job() {
    let (coordinator, notifier) = setup(PipelineConfig::default()).await;
    let store = coordinator.store().clone();
    let job_id = coordinator.submit(individual(&[System::Western])).await.unwrap();

    let worker = WorkerBuilder::new(coordinator.clone())
        .worker_id("w-crash")
        .producer(StubProducer::new(TaskType::TextGeneration))
        .producer(Exploding)
        .build();

    let err = worker.drain().await.unwrap_err();
    let audio = store
        .tasks_for_job(job_id)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.task_type == TaskType::AudioGeneration)
        .unwrap();

    match err {
        WorkerError::Fatal { task_id, message } => {
            assert_eq!(task_id, Some(audio.id));
            assert_eq!(message, "synthesizer exploded");
        }
        other => panic!("expected a fatal error, got {other:?}"),
    }

    assert_eq!(audio.status, TaskStatus::Failed);
    let error = audio.error.unwrap();
    assert!(error.contains("w-crash"));
    assert!(error.contains("synthesizer exploded"));

    let job = store.job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert!(job.error.is_some());

    assert_eq!(notifier.count(), 1);
    assert_eq!(notifier.snapshots()[0].status, JobStatus::Error);
    assert!(worker.context().is_idle());
}

#[tokio::test]
async fn test_run_loop_exits_after_fault() {
    let (coordinator, notifier) = setup(PipelineConfig::default()).await;
    let job_id = coordinator.submit(individual(&[System::Vedic])).await.unwrap();

    let worker = WorkerBuilder::new(coordinator.clone())
        .poll_interval(Duration::from_millis(10))
        .producer(StubProducer::new(TaskType::TextGeneration))
        .producer(Exploding)
        .build();

    let shutdown = CancellationToken::new();
    let result = tokio::time::timeout(Duration::from_secs(5), worker.run(shutdown.clone()))
        .await
        .expect("worker should stop on its own");
    assert!(matches!(result, Err(WorkerError::Fatal { .. })));
    assert!(!shutdown.is_cancelled());

    assert_eq!(
        coordinator.snapshot(job_id).await.unwrap().status,
        JobStatus::Error
    );

    // The job's remaining tasks are no longer claimable.
    let pdf_worker = WorkerBuilder::new(coordinator.clone())
        .producer(StubProducer::new(TaskType::PdfGeneration))
        .build();
    assert_eq!(pdf_worker.drain().await.unwrap(), 0);
    assert_eq!(notifier.count(), 1);
}

#[tokio::test]
async fn test_fault_leaves_reclaimed_task_to_its_new_owner() {
    let (coordinator, notifier) = setup(PipelineConfig::default()).await;
    let store = coordinator.store().clone();
    let job_id = coordinator.submit(individual(&[System::Western])).await.unwrap();

    let slow = coordinator
        .claim(TaskType::TextGeneration, "w-slow")
        .await
        .unwrap()
        .unwrap();
    let context = WorkerContext::new("w-slow");
    context.hold(&slow);

    // w-slow never heartbeats, so its task goes back to the queue and w-fresh takes it.
    let report = coordinator
        .reclaim_stale(Utc::now() + ChronoDuration::hours(1))
        .await
        .unwrap();
    assert_eq!(report.reset, vec![slow.id]);
    let fresh = coordinator
        .claim(TaskType::TextGeneration, "w-fresh")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh.id, slow.id);

    let err = CrashGuard::new(coordinator.clone())
        .handle_fault(&context, slow.id, job_id, "late panic on w-slow")
        .await;
    assert!(matches!(err, WorkerError::Fatal { task_id: Some(id), .. } if id == slow.id));
    assert!(context.is_idle());

    let record = store.task(slow.id).await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Processing);
    assert_eq!(record.worker_id.as_deref(), Some("w-fresh"));
    assert_eq!(store.job(job_id).await.unwrap().unwrap().status, JobStatus::Processing);
    assert_eq!(notifier.count(), 0);

    assert!(coordinator.complete(&fresh, &output_for(&fresh)).await.unwrap());
}

const EXIT_CHILD_ENV: &str = "READINGFLOW_RUN_OR_EXIT_CHILD";

#[tokio::test]
async fn test_run_or_exit_ends_the_process_on_fault() {
    if std::env::var_os(EXIT_CHILD_ENV).is_some() {
        let (coordinator, _) = setup(PipelineConfig::default()).await;
        coordinator.submit(individual(&[System::Western])).await.unwrap();
        let worker = WorkerBuilder::new(coordinator.clone())
            .poll_interval(Duration::from_millis(10))
            .producer(StubProducer::new(TaskType::TextGeneration))
            .producer(Exploding)
            .build();
        worker.run_or_exit(CancellationToken::new()).await;
        panic!("run_or_exit returned after a fault");
    }

    // Run this same test in a child process, which must die with status 1.
    let status = std::process::Command::new(std::env::current_exe().unwrap())
        .args(["test_run_or_exit_ends_the_process_on_fault", "--exact", "--nocapture"])
        .env(EXIT_CHILD_ENV, "1")
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}
