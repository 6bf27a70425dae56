//! Typed task payloads.
//!
//! Each stage has its own input and output shape. They are stored as JSON
//! in the task row, tagged with the stage name so a row can always be
//! decoded without consulting its `task_type` column.

use serde::{Deserialize, Serialize};

use crate::model::{ArtifactType, NewArtifact, TaskId, TaskType};
use crate::plan::Document;

/// Input for a text generation task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextInput {
    pub document: Document,
    #[serde(default)]
    pub voice: Option<String>,
}

/// Input for a narration task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioInput {
    pub document: Document,
    pub source_task_id: TaskId,
    pub text_path: String,
    #[serde(default)]
    pub voice: Option<String>,
    /// Lyrics to hand to the song stage once narration is done.
    #[serde(default)]
    pub lyrics_path: Option<String>,
}

/// Input for a PDF render task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfInput {
    pub document: Document,
    pub source_task_id: TaskId,
    pub text_path: String,
}

/// Input for a song synthesis task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongInput {
    pub document: Document,
    pub source_task_id: TaskId,
    pub audio_path: String,
    pub lyrics_path: String,
    #[serde(default)]
    pub voice: Option<String>,
}

/// Stage-specific task input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum TaskInput {
    Text(TextInput),
    Audio(AudioInput),
    Pdf(PdfInput),
    Song(SongInput),
}

impl TaskInput {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskInput::Text(_) => TaskType::TextGeneration,
            TaskInput::Audio(_) => TaskType::AudioGeneration,
            TaskInput::Pdf(_) => TaskType::PdfGeneration,
            TaskInput::Song(_) => TaskType::SongGeneration,
        }
    }

    pub fn document(&self) -> &Document {
        match self {
            TaskInput::Text(i) => &i.document,
            TaskInput::Audio(i) => &i.document,
            TaskInput::Pdf(i) => &i.document,
            TaskInput::Song(i) => &i.document,
        }
    }

    /// Upstream task this input was derived from.
    pub fn source_task_id(&self) -> Option<TaskId> {
        match self {
            TaskInput::Text(_) => None,
            TaskInput::Audio(i) => Some(i.source_task_id),
            TaskInput::Pdf(i) => Some(i.source_task_id),
            TaskInput::Song(i) => Some(i.source_task_id),
        }
    }
}

/// Output of a text generation task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextOutput {
    pub text_path: String,
    pub word_count: u64,
    /// Song lyrics derived from the text, when the producer wrote them.
    #[serde(default)]
    pub lyrics_path: Option<String>,
}

/// Output of a narration task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioOutput {
    pub audio_path: String,
    pub byte_count: u64,
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

/// Output of a PDF render task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfOutput {
    pub pdf_path: String,
    pub byte_count: u64,
    #[serde(default)]
    pub page_count: Option<u32>,
}

/// Output of a song synthesis task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongOutput {
    pub song_path: String,
    pub byte_count: u64,
}

/// Stage-specific task output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum TaskOutput {
    Text(TextOutput),
    Audio(AudioOutput),
    Pdf(PdfOutput),
    Song(SongOutput),
}

impl TaskOutput {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskOutput::Text(_) => TaskType::TextGeneration,
            TaskOutput::Audio(_) => TaskType::AudioGeneration,
            TaskOutput::Pdf(_) => TaskType::PdfGeneration,
            TaskOutput::Song(_) => TaskType::SongGeneration,
        }
    }

    /// Where the produced artifact lives.
    pub fn storage_path(&self) -> &str {
        match self {
            TaskOutput::Text(o) => &o.text_path,
            TaskOutput::Audio(o) => &o.audio_path,
            TaskOutput::Pdf(o) => &o.pdf_path,
            TaskOutput::Song(o) => &o.song_path,
        }
    }

    /// The artifact row to record when the task completes.
    pub fn artifact(&self, document: &Document) -> NewArtifact {
        let mut metadata = serde_json::json!({
            "document": document.number,
            "system": document.system,
            "title": document.title,
        });
        let (artifact_type, extra) = match self {
            TaskOutput::Text(o) => (
                ArtifactType::Text,
                serde_json::json!({ "word_count": o.word_count }),
            ),
            TaskOutput::Audio(o) => (
                ArtifactType::AudioMp3,
                serde_json::json!({ "byte_count": o.byte_count, "duration_secs": o.duration_secs }),
            ),
            TaskOutput::Pdf(o) => (
                ArtifactType::Pdf,
                serde_json::json!({ "byte_count": o.byte_count, "page_count": o.page_count }),
            ),
            TaskOutput::Song(o) => (
                ArtifactType::AudioSong,
                serde_json::json!({ "byte_count": o.byte_count }),
            ),
        };
        if let (Some(base), Some(extra)) = (metadata.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
        }

        NewArtifact {
            artifact_type,
            storage_path: self.storage_path().to_string(),
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Person, Subject, System};

    fn document() -> Document {
        Document {
            number: 2,
            system: Some(System::Vedic),
            title: "Vedic Astrology: Ada".into(),
            subject: Subject::Person {
                person: Person::new("Ada"),
            },
        }
    }

    #[test]
    fn input_is_tagged_with_its_stage() {
        let input = TaskInput::Pdf(PdfInput {
            document: document(),
            source_task_id: TaskId(7),
            text_path: "jobs/1/2/text.md".into(),
        });
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["stage"], "pdf");
        assert_eq!(json["source_task_id"], 7);
        assert_eq!(json["document"]["subject"]["subject"], "person");

        let back: TaskInput = serde_json::from_value(json).unwrap();
        assert_eq!(back, input);
        assert_eq!(back.task_type(), TaskType::PdfGeneration);
        assert_eq!(back.source_task_id(), Some(TaskId(7)));
    }

    #[test]
    fn artifact_metadata_merges_document_and_counts() {
        let output = TaskOutput::Text(TextOutput {
            text_path: "jobs/1/2/text.md".into(),
            word_count: 5400,
            lyrics_path: None,
        });
        let artifact = output.artifact(&document());
        assert_eq!(artifact.artifact_type, ArtifactType::Text);
        assert_eq!(artifact.storage_path, "jobs/1/2/text.md");
        assert_eq!(artifact.metadata["document"], 2);
        assert_eq!(artifact.metadata["system"], "vedic");
        assert_eq!(artifact.metadata["word_count"], 5400);
    }
}
