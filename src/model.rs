//! Jobs, tasks and artifacts as they live in the task store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::payload::{TaskInput, TaskOutput};
use crate::plan::JobRequest;

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

/// Unique identifier for an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returned when a stored enum column holds an unknown value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Pipeline stage a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    TextGeneration,
    AudioGeneration,
    PdfGeneration,
    SongGeneration,
}

string_enum!(TaskType, "task type", {
    TextGeneration => "text_generation",
    AudioGeneration => "audio_generation",
    PdfGeneration => "pdf_generation",
    SongGeneration => "song_generation",
});

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::TextGeneration,
        TaskType::AudioGeneration,
        TaskType::PdfGeneration,
        TaskType::SongGeneration,
    ];
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

string_enum!(TaskStatus, "task status", {
    Pending => "pending",
    Processing => "processing",
    Complete => "complete",
    Failed => "failed",
});

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Complete,
    Error,
    Cancelled,
}

string_enum!(JobStatus, "job status", {
    Queued => "queued",
    Processing => "processing",
    Complete => "complete",
    Error => "error",
    Cancelled => "cancelled",
});

impl JobStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }
}

/// Whether a job reads one person or a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Individual,
    Overlay,
}

string_enum!(JobKind, "job kind", {
    Individual => "individual",
    Overlay => "overlay",
});

/// Kind of durable output a completed task leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Text,
    Pdf,
    AudioMp3,
    AudioSong,
}

string_enum!(ArtifactType, "artifact type", {
    Text => "text",
    Pdf => "pdf",
    AudioMp3 => "audio_mp3",
    AudioSong => "audio_song",
});

/// A job row.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub owner_id: String,
    pub kind: JobKind,
    pub request: JobRequest,
    pub status: JobStatus,
    pub phase: String,
    pub message: Option<String>,
    pub percent: u32,
    pub completed_tasks: u32,
    pub expected_tasks: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A task row.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub job_id: JobId,
    pub task_type: TaskType,
    pub sequence: u32,
    pub source_task_id: Option<TaskId>,
    pub status: TaskStatus,
    pub input: TaskInput,
    pub output: Option<TaskOutput>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub worker_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub heartbeat_timeout_secs: u64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A task owned by the worker that claimed it.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: TaskId,
    pub job_id: JobId,
    pub task_type: TaskType,
    pub sequence: u32,
    pub source_task_id: Option<TaskId>,
    pub input: TaskInput,
    pub attempts: u32,
    pub max_attempts: u32,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
    pub heartbeat_timeout: Duration,
}

impl ClaimedTask {
    /// True when a failure of this attempt cannot be retried.
    pub fn is_last_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Durable record of an artifact.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactRecord {
    pub id: ArtifactId,
    pub job_id: JobId,
    pub task_id: Option<TaskId>,
    pub artifact_type: ArtifactType,
    pub storage_path: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Artifact reference produced by a completed task.
#[derive(Debug, Clone, PartialEq)]
pub struct NewArtifact {
    pub artifact_type: ArtifactType,
    pub storage_path: String,
    pub metadata: serde_json::Value,
}

/// A task to insert.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: TaskType,
    pub sequence: u32,
    pub source_task_id: Option<TaskId>,
    pub input: TaskInput,
    pub max_attempts: u32,
    pub heartbeat_timeout: Duration,
}

/// A job and its first-stage tasks, inserted together.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: String,
    pub kind: JobKind,
    pub request: JobRequest,
    pub expected_tasks: u32,
    pub tasks: Vec<NewTask>,
}
