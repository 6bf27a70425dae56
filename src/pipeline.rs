//! Stage graph and downstream task expansion.
//!
//! Each document runs through a fixed chain:
//!
//! ```text
//! text_generation ──┬──> pdf_generation
//!                   └──> audio_generation ──> song_generation (when songs are requested)
//! ```
//!
//! Downstream tasks are inserted only once their upstream task is complete,
//! and their input points at the upstream output.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::model::{TaskId, TaskRecord, TaskStatus, TaskType};
use crate::payload::{AudioInput, PdfInput, SongInput, TaskInput, TaskOutput};
use crate::plan::JobRequest;
use crate::runner::store::{Expansion, TaskError, TaskStore};

/// Inputs of the tasks that follow a completed task.
///
/// PDF and song stages are leaves. A mismatched input/output pair yields nothing.
pub fn downstream(task: &TaskRecord, output: &TaskOutput, request: &JobRequest) -> Vec<TaskInput> {
    match (&task.input, output) {
        (TaskInput::Text(input), TaskOutput::Text(text)) => {
            let lyrics_path = request
                .options
                .songs
                .then(|| text.lyrics_path.clone().unwrap_or_else(|| text.text_path.clone()));
            vec![
                TaskInput::Pdf(PdfInput {
                    document: input.document.clone(),
                    source_task_id: task.id,
                    text_path: text.text_path.clone(),
                }),
                TaskInput::Audio(AudioInput {
                    document: input.document.clone(),
                    source_task_id: task.id,
                    text_path: text.text_path.clone(),
                    voice: input.voice.clone(),
                    lyrics_path,
                }),
            ]
        }
        (TaskInput::Audio(input), TaskOutput::Audio(audio)) => match &input.lyrics_path {
            Some(lyrics_path) => vec![TaskInput::Song(SongInput {
                document: input.document.clone(),
                source_task_id: task.id,
                audio_path: audio.audio_path.clone(),
                lyrics_path: lyrics_path.clone(),
                voice: input.voice.clone(),
            })],
            None => Vec::new(),
        },
        (TaskInput::Pdf(_), TaskOutput::Pdf(_)) | (TaskInput::Song(_), TaskOutput::Song(_)) => {
            Vec::new()
        }
        (input, output) => {
            warn!(
                task_id = %task.id,
                input = %input.task_type(),
                output = %output.task_type(),
                "output does not match task input, not expanding"
            );
            Vec::new()
        }
    }
}

/// Whether a task goes on to insert downstream tasks once complete.
pub fn has_downstream(task: &TaskRecord) -> bool {
    match (task.task_type, &task.input) {
        (TaskType::TextGeneration, _) => true,
        (TaskType::AudioGeneration, TaskInput::Audio(audio)) => audio.lyrics_path.is_some(),
        _ => false,
    }
}

/// Inserts the next stages of a job when a task completes.
pub struct PipelineExpander<S: TaskStore> {
    store: Arc<S>,
    config: PipelineConfig,
}

impl<S: TaskStore> Clone for PipelineExpander<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: TaskStore + 'static> PipelineExpander<S> {
    pub fn new(store: Arc<S>, config: PipelineConfig) -> Self {
        Self { store, config }
    }

    /// Insert the downstream tasks of `task_id`. Returns the ids created by
    /// this call; repeated calls for the same task create nothing.
    pub async fn on_task_complete(&self, task_id: TaskId) -> Result<Vec<TaskId>, TaskError> {
        let task = self
            .store
            .task(task_id)
            .await?
            .ok_or(TaskError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Complete {
            debug!(task_id = %task_id, status = %task.status, "upstream not complete, not expanding");
            return Ok(Vec::new());
        }
        let Some(output) = task.output.as_ref() else {
            warn!(task_id = %task_id, "complete task has no output, not expanding");
            return Ok(Vec::new());
        };

        let job = self
            .store
            .job(task.job_id)
            .await?
            .ok_or(TaskError::JobNotFound(task.job_id))?;

        let new_tasks: Vec<_> = downstream(&task, output, &job.request)
            .into_iter()
            .map(|input| self.config.new_task(input, Some(task.id)))
            .collect();
        if new_tasks.is_empty() {
            return Ok(Vec::new());
        }

        match self.store.expand(task.id, new_tasks).await? {
            Expansion::Inserted { created, existing } => {
                info!(
                    job_id = %task.job_id,
                    task_id = %task.id,
                    created = created.len(),
                    existing = existing.len(),
                    "expanded downstream tasks"
                );
                Ok(created)
            }
            Expansion::Skipped(reason) => {
                debug!(job_id = %task.job_id, task_id = %task.id, ?reason, "expansion skipped");
                Ok(Vec::new())
            }
        }
    }

    /// Expand completed tasks whose downstream insert never happened, for
    /// example because the worker died between completing and expanding.
    pub async fn expand_missing(&self, limit: usize) -> Result<Vec<TaskId>, TaskError> {
        let mut created = Vec::new();
        for task in self.store.unexpanded_tasks(limit).await? {
            created.extend(self.on_task_complete(task.id).await?);
        }
        if !created.is_empty() {
            info!(created = created.len(), "repaired missing expansions");
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobId, JobKind};
    use crate::payload::{AudioOutput, PdfOutput, TextInput, TextOutput};
    use crate::plan::{Document, JobOptions, Person, Subject, System};
    use chrono::Utc;

    fn request(songs: bool) -> JobRequest {
        JobRequest {
            owner_id: "u".into(),
            kind: JobKind::Individual,
            people: vec![Person::new("Ada")],
            systems: vec![System::GeneKeys],
            voice: Some("alto".into()),
            options: JobOptions {
                songs,
                verdict: false,
            },
        }
    }

    fn document() -> Document {
        Document {
            number: 1,
            system: Some(System::GeneKeys),
            title: "Gene Keys: Ada".into(),
            subject: Subject::Person {
                person: Person::new("Ada"),
            },
        }
    }

    fn record(id: i64, input: TaskInput) -> TaskRecord {
        let now = Utc::now();
        TaskRecord {
            id: TaskId(id),
            job_id: JobId(1),
            task_type: input.task_type(),
            sequence: 1,
            source_task_id: input.source_task_id(),
            status: TaskStatus::Complete,
            input,
            output: None,
            attempts: 1,
            max_attempts: 3,
            worker_id: Some("w".into()),
            claimed_at: Some(now),
            last_heartbeat: None,
            heartbeat_timeout_secs: 120,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: Some(now),
        }
    }

    fn text_task() -> TaskRecord {
        record(
            10,
            TaskInput::Text(TextInput {
                document: document(),
                voice: Some("alto".into()),
            }),
        )
    }

    fn text_output(lyrics: Option<&str>) -> TaskOutput {
        TaskOutput::Text(TextOutput {
            text_path: "jobs/1/1/text.md".into(),
            word_count: 4000,
            lyrics_path: lyrics.map(String::from),
        })
    }

    #[test]
    fn text_fans_out_to_pdf_and_audio() {
        let next = downstream(&text_task(), &text_output(None), &request(false));
        let types: Vec<_> = next.iter().map(|i| i.task_type()).collect();
        assert_eq!(types, vec![TaskType::PdfGeneration, TaskType::AudioGeneration]);
        assert!(next.iter().all(|i| i.source_task_id() == Some(TaskId(10))));

        match &next[1] {
            TaskInput::Audio(audio) => {
                assert_eq!(audio.text_path, "jobs/1/1/text.md");
                assert_eq!(audio.voice.as_deref(), Some("alto"));
                assert_eq!(audio.lyrics_path, None);
            }
            other => panic!("expected audio input, got {other:?}"),
        }
    }

    #[test]
    fn songs_carry_lyrics_through_audio() {
        let next = downstream(&text_task(), &text_output(Some("jobs/1/1/lyrics.txt")), &request(true));
        let TaskInput::Audio(audio_input) = next[1].clone() else {
            panic!("expected audio input");
        };
        assert_eq!(audio_input.lyrics_path.as_deref(), Some("jobs/1/1/lyrics.txt"));

        let audio_task = record(11, TaskInput::Audio(audio_input));
        let audio_output = TaskOutput::Audio(AudioOutput {
            audio_path: "jobs/1/1/reading.mp3".into(),
            byte_count: 1024,
            duration_secs: Some(1800),
        });
        let songs = downstream(&audio_task, &audio_output, &request(true));
        assert_eq!(songs.len(), 1);
        match &songs[0] {
            TaskInput::Song(song) => {
                assert_eq!(song.source_task_id, TaskId(11));
                assert_eq!(song.audio_path, "jobs/1/1/reading.mp3");
                assert_eq!(song.lyrics_path, "jobs/1/1/lyrics.txt");
            }
            other => panic!("expected song input, got {other:?}"),
        }
    }

    #[test]
    fn songs_fall_back_to_the_text_when_no_lyrics_were_written() {
        let next = downstream(&text_task(), &text_output(None), &request(true));
        match &next[1] {
            TaskInput::Audio(audio) => {
                assert_eq!(audio.lyrics_path.as_deref(), Some("jobs/1/1/text.md"));
            }
            other => panic!("expected audio input, got {other:?}"),
        }
    }

    #[test]
    fn leaves_and_mismatches_expand_to_nothing() {
        let pdf = record(
            12,
            TaskInput::Pdf(PdfInput {
                document: document(),
                source_task_id: TaskId(10),
                text_path: "t".into(),
            }),
        );
        let pdf_output = TaskOutput::Pdf(PdfOutput {
            pdf_path: "p".into(),
            byte_count: 1,
            page_count: None,
        });
        assert!(downstream(&pdf, &pdf_output, &request(true)).is_empty());
        assert!(downstream(&text_task(), &pdf_output, &request(true)).is_empty());
        assert!(!has_downstream(&pdf));
    }

    #[test]
    fn only_text_and_song_bound_audio_have_downstream() {
        assert!(has_downstream(&text_task()));

        let audio = |lyrics: Option<&str>| {
            record(
                11,
                TaskInput::Audio(AudioInput {
                    document: document(),
                    source_task_id: TaskId(10),
                    text_path: "t".into(),
                    voice: None,
                    lyrics_path: lyrics.map(String::from),
                }),
            )
        };
        assert!(has_downstream(&audio(Some("jobs/1/1/lyrics.txt"))));
        assert!(!has_downstream(&audio(None)));
    }
}
