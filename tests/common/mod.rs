#![allow(dead_code)]

use async_trait::async_trait;
use readingflow::{
    AudioOutput, ClaimedTask, Coordinator, JobKind, JobOptions, JobRequest, JobSnapshot,
    Notifier, PdfOutput, PipelineConfig, Person, Producer, ProducerError, SongOutput,
    SqliteTaskStore, System, TaskInput, TaskOutput, TaskType, TextOutput,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub async fn setup_store() -> SqliteTaskStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteTaskStore::new(pool);
    store.run_migrations().await.unwrap();
    store
}

pub async fn setup(config: PipelineConfig) -> (Arc<Coordinator<SqliteTaskStore>>, Arc<CountingNotifier>) {
    let store = Arc::new(setup_store().await);
    let notifier = Arc::new(CountingNotifier::default());
    let coordinator = Arc::new(Coordinator::new(store, config, notifier.clone()));
    (coordinator, notifier)
}

/// Individual reading of one person across the given systems.
pub fn individual(systems: &[System]) -> JobRequest {
    JobRequest {
        owner_id: "user-1".to_string(),
        kind: JobKind::Individual,
        people: vec![Person {
            name: "Ada".to_string(),
            details: serde_json::json!({ "born": "1815-12-10" }),
        }],
        systems: systems.to_vec(),
        voice: Some("warm".to_string()),
        options: JobOptions::default(),
    }
}

pub fn with_songs(mut request: JobRequest) -> JobRequest {
    request.options.songs = true;
    request
}

/// Output a well-behaved producer of `task`'s stage would return.
pub fn output_for(task: &ClaimedTask) -> TaskOutput {
    let n = task.sequence;
    match &task.input {
        TaskInput::Text(_) => TaskOutput::Text(TextOutput {
            text_path: format!("jobs/{}/doc-{}.md", task.job_id, n),
            word_count: 1200,
            lyrics_path: None,
        }),
        TaskInput::Audio(_) => TaskOutput::Audio(AudioOutput {
            audio_path: format!("jobs/{}/doc-{}.mp3", task.job_id, n),
            byte_count: 4096,
            duration_secs: Some(300),
        }),
        TaskInput::Pdf(_) => TaskOutput::Pdf(PdfOutput {
            pdf_path: format!("jobs/{}/doc-{}.pdf", task.job_id, n),
            byte_count: 2048,
            page_count: Some(4),
        }),
        TaskInput::Song(_) => TaskOutput::Song(SongOutput {
            song_path: format!("jobs/{}/doc-{}-song.mp3", task.job_id, n),
            byte_count: 8192,
        }),
    }
}

/// Producer that succeeds immediately with a canned output.
pub struct StubProducer {
    pub task_type: TaskType,
    pub calls: Arc<AtomicUsize>,
}

impl StubProducer {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Producer for StubProducer {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn invoke(&self, task: &ClaimedTask) -> Result<TaskOutput, ProducerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(output_for(task))
    }
}

/// Producer that fails permanently for one document and succeeds otherwise.
pub struct FailingForDocument {
    pub task_type: TaskType,
    pub sequence: u32,
}

#[async_trait]
impl Producer for FailingForDocument {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn invoke(&self, task: &ClaimedTask) -> Result<TaskOutput, ProducerError> {
        if task.sequence == self.sequence {
            return Err(ProducerError::permanent(anyhow::anyhow!(
                "provider rejected document {}",
                task.sequence
            )));
        }
        Ok(output_for(task))
    }
}

/// Counts and keeps every terminal snapshot it receives.
#[derive(Default)]
pub struct CountingNotifier {
    count: AtomicUsize,
    snapshots: Mutex<Vec<JobSnapshot>>,
}

impl CountingNotifier {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        self.snapshots.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for CountingNotifier {
    async fn job_finished(&self, snapshot: &JobSnapshot) -> anyhow::Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.snapshots.lock().unwrap().push(snapshot.clone());
        Ok(())
    }
}
