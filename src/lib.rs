//! # Readingflow
//!
//! Job and task orchestration for generated readings.
//!
//! One request becomes a job; the job becomes a chain of small, independently
//! retryable tasks (text, then PDF and narration, then an optional song) that
//! any number of stateless workers claim from a shared store.
//!
//! - **Exclusive claims** - a conditional update hands each task to one worker
//! - **Heartbeats** - long provider calls stay owned while the worker is alive
//! - **Self-healing** - the reclaimer returns tasks of dead workers to the queue
//! - **Fail-fast** - a panicking worker fails its task and job before it exits
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use readingflow::{Coordinator, PipelineConfig, SqliteTaskStore, TracingNotifier, WorkerBuilder};
//!
//! let store = Arc::new(SqliteTaskStore::connect("sqlite://readingflow.db", 5).await?);
//! store.run_migrations().await?;
//!
//! let coordinator = Arc::new(Coordinator::new(store, PipelineConfig::default(), Arc::new(TracingNotifier)));
//! let job_id = coordinator.submit(request).await?;
//!
//! let worker = WorkerBuilder::new(coordinator.clone())
//!     .producer(MyTextProducer)
//!     .producer(MyPdfRenderer)
//!     .build();
//! worker.run(shutdown).await?;
//! ```
//!
//! ## Reclaiming
//!
//! Run a [`Reclaimer`] somewhere, independent of the workers:
//!
//! ```rust,ignore
//! let reclaimer = ReclaimerBuilder::new(coordinator)
//!     .interval(Duration::from_secs(30))
//!     .build();
//! reclaimer.run(shutdown).await;
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` - Enable the SQLite-backed task store

pub mod config;
pub mod guard;
pub mod model;
pub mod notify;
pub mod payload;
pub mod pipeline;
pub mod plan;
pub mod producer;
pub mod progress;
pub mod retry;
pub mod runner;
pub mod scheduler;

pub use config::{PipelineConfig, ReclaimerConfig, Settings, StageConfig, WorkerConfig};
pub use guard::{CrashGuard, HeldTask, WorkerContext, WorkerError};
pub use model::{
    ArtifactId, ArtifactRecord, ArtifactType, ClaimedTask, JobId, JobKind, JobRecord, JobStatus,
    NewArtifact, NewJob, NewTask, TaskId, TaskRecord, TaskStatus, TaskType,
};
pub use notify::{NoopNotifier, Notifier, TracingNotifier};
pub use payload::{
    AudioInput, AudioOutput, PdfInput, PdfOutput, SongInput, SongOutput, TaskInput, TaskOutput,
    TextInput, TextOutput,
};
pub use pipeline::PipelineExpander;
pub use plan::{Document, DocumentPlan, JobOptions, JobRequest, Person, PlanError, Subject, System};
pub use producer::{Producer, ProducerError};
pub use progress::{aggregate, JobSnapshot, Phase, ProgressAggregator, TaskSummary};
pub use retry::RetryPolicy;
pub use runner::{
    truncate_error, Coordinator, Expansion, FailOutcome, GracePeriods, HeartbeatEmitter,
    ReclaimReport, SkipReason, TaskError, TaskStore, Worker, WorkerBuilder, MAX_ERROR_LEN,
};
pub use scheduler::{Reclaimer, ReclaimerBuilder, SweepReport};

#[cfg(feature = "sqlite")]
pub use runner::SqliteTaskStore;
