//! Basic usage example for readingflow.
//!
//! This example demonstrates:
//! - Implementing the Producer trait for each stage
//! - Submitting a job and letting a worker drive it to completion
//! - Running the reclaimer alongside the worker
//! - Reading the progress snapshot and artifacts at the end

use async_trait::async_trait;
use readingflow::{
    AudioOutput, ClaimedTask, Coordinator, JobKind, JobOptions, JobRequest, JobStatus, PdfOutput,
    Person, PipelineConfig, Producer, ProducerError, ReclaimerBuilder, SongOutput,
    SqliteTaskStore, System, TaskOutput, TaskType, TextOutput, TracingNotifier, WorkerBuilder,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Writes a reading. A real producer would call an LLM here.
struct Writer;

#[async_trait]
impl Producer for Writer {
    fn task_type(&self) -> TaskType {
        TaskType::TextGeneration
    }

    async fn invoke(&self, task: &ClaimedTask) -> Result<TaskOutput, ProducerError> {
        println!("[writer] {}", task.input.document().title);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(TaskOutput::Text(TextOutput {
            text_path: format!("jobs/{}/{}/reading.md", task.job_id, task.sequence),
            word_count: 3800,
            lyrics_path: Some(format!("jobs/{}/{}/lyrics.txt", task.job_id, task.sequence)),
        }))
    }
}

/// Renders the reading to a PDF.
struct Renderer;

#[async_trait]
impl Producer for Renderer {
    fn task_type(&self) -> TaskType {
        TaskType::PdfGeneration
    }

    async fn invoke(&self, task: &ClaimedTask) -> Result<TaskOutput, ProducerError> {
        println!("[renderer] document {}", task.sequence);
        Ok(TaskOutput::Pdf(PdfOutput {
            pdf_path: format!("jobs/{}/{}/reading.pdf", task.job_id, task.sequence),
            byte_count: 180_000,
            page_count: Some(12),
        }))
    }
}

/// Narrates the reading.
struct Narrator;

#[async_trait]
impl Producer for Narrator {
    fn task_type(&self) -> TaskType {
        TaskType::AudioGeneration
    }

    async fn invoke(&self, task: &ClaimedTask) -> Result<TaskOutput, ProducerError> {
        println!("[narrator] document {}", task.sequence);
        tokio::time::sleep(Duration::from_millis(80)).await;
        Ok(TaskOutput::Audio(AudioOutput {
            audio_path: format!("jobs/{}/{}/reading.mp3", task.job_id, task.sequence),
            byte_count: 14_000_000,
            duration_secs: Some(1740),
        }))
    }
}

/// Sets the lyrics to music.
struct Composer;

#[async_trait]
impl Producer for Composer {
    fn task_type(&self) -> TaskType {
        TaskType::SongGeneration
    }

    async fn invoke(&self, task: &ClaimedTask) -> Result<TaskOutput, ProducerError> {
        println!("[composer] document {}", task.sequence);
        Ok(TaskOutput::Song(SongOutput {
            song_path: format!("jobs/{}/{}/song.mp3", task.job_id, task.sequence),
            byte_count: 4_000_000,
        }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("readingflow=info")),
        )
        .init();

    println!("=== readingflow - Basic Example ===\n");

    // A single connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    let store = SqliteTaskStore::new(pool);
    store.run_migrations().await?;

    let coordinator = Arc::new(Coordinator::new(
        Arc::new(store),
        PipelineConfig::default(),
        Arc::new(TracingNotifier),
    ));

    let request = JobRequest {
        owner_id: "demo-user".to_string(),
        kind: JobKind::Overlay,
        people: vec![Person::new("Ada"), Person::new("Charles")],
        systems: vec![System::Western, System::Vedic],
        voice: Some("warm".to_string()),
        options: JobOptions {
            songs: true,
            verdict: true,
        },
    };
    let job_id = coordinator.submit(request).await?;
    println!("Submitted job {}\n", job_id);

    let shutdown = CancellationToken::new();

    let worker = WorkerBuilder::new(coordinator.clone())
        .worker_id("demo-worker")
        .poll_interval(Duration::from_millis(50))
        .producer(Writer)
        .producer(Renderer)
        .producer(Narrator)
        .producer(Composer)
        .build();
    let worker_token = shutdown.clone();
    // A panicking producer would end the demo process here.
    let worker_handle = tokio::spawn(async move { worker.run_or_exit(worker_token).await });

    let reclaimer = ReclaimerBuilder::new(coordinator.clone())
        .interval(Duration::from_secs(5))
        .build();
    let reclaimer_token = shutdown.clone();
    let reclaimer_handle = tokio::spawn(async move { reclaimer.run(reclaimer_token).await });

    let snapshot = loop {
        let snapshot = coordinator.snapshot(job_id).await?;
        if snapshot.status.is_terminal() {
            break snapshot;
        }
        println!("  {:>3}% {} ({})", snapshot.percent, snapshot.phase, snapshot.message);
        tokio::time::sleep(Duration::from_millis(200)).await;
    };

    shutdown.cancel();
    worker_handle.await?;
    reclaimer_handle.await?;

    println!("\nJob {} finished: {}", job_id, snapshot.message);
    if snapshot.status == JobStatus::Complete {
        for artifact in coordinator.artifacts(job_id).await? {
            println!("  {:<10} {}", artifact.artifact_type.as_str(), artifact.storage_path);
        }
    } else if let Some(error) = snapshot.error {
        eprintln!("  error: {}", error);
    }

    Ok(())
}
