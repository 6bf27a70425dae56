//! Job requests and the documents they expand into.
//!
//! A request names the people to read, the systems to apply and a few
//! options. Planning turns it into a numbered list of [`Document`]s; every
//! document gets its own text task, and later its own media tasks.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::model::{JobKind, TaskType};

/// One of the analytical lenses a reading can be written through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum System {
    Western,
    Vedic,
    HumanDesign,
    GeneKeys,
    Kabbalah,
}

impl System {
    pub const ALL: [System; 5] = [
        System::Western,
        System::Vedic,
        System::HumanDesign,
        System::GeneKeys,
        System::Kabbalah,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            System::Western => "Western Astrology",
            System::Vedic => "Vedic Astrology",
            System::HumanDesign => "Human Design",
            System::GeneKeys => "Gene Keys",
            System::Kabbalah => "Kabbalah",
        }
    }
}

/// A person being read. Birth data is opaque to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl Person {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            details: serde_json::Value::Null,
        }
    }
}

/// Optional extras for a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Render a song for every document once its narration exists.
    #[serde(default)]
    pub songs: bool,
    /// Add a closing verdict document to an overlay job.
    #[serde(default)]
    pub verdict: bool,
}

/// A request to produce readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub owner_id: String,
    pub kind: JobKind,
    pub people: Vec<Person>,
    pub systems: Vec<System>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub options: JobOptions,
}

/// Why a request cannot be planned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("at least one system is required")]
    NoSystems,

    #[error("system {0:?} requested more than once")]
    DuplicateSystem(System),

    #[error("{kind} jobs need {expected} people, got {actual}")]
    WrongPeopleCount {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("person name must not be empty")]
    EmptyName,

    #[error("owner id must not be empty")]
    EmptyOwner,

    #[error("a verdict is only available for overlay jobs")]
    VerdictWithoutOverlay,
}

/// Who a document is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subject", rename_all = "snake_case")]
pub enum Subject {
    /// Individual reading of one person.
    Person { person: Person },
    /// Synastry between two people in one system.
    Overlay { first: Person, second: Person },
    /// Closing verdict across every system for a pair.
    Verdict { first: Person, second: Person },
}

/// One document the job produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable 1-based number within the job, used as the task sequence.
    pub number: u32,
    /// `None` only for verdicts, which span every requested system.
    pub system: Option<System>,
    pub title: String,
    pub subject: Subject,
}

/// The documents a request expands to and the stages each one runs through.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentPlan {
    pub documents: Vec<Document>,
    pub stages: Vec<TaskType>,
}

impl DocumentPlan {
    /// Validate a request and number its documents.
    pub fn from_request(request: &JobRequest) -> Result<Self, PlanError> {
        request.validate()?;

        let mut documents = Vec::new();
        let mut push = |system: Option<System>, title: String, subject: Subject| {
            let number = documents.len() as u32 + 1;
            documents.push(Document {
                number,
                system,
                title,
                subject,
            });
        };

        match request.kind {
            JobKind::Individual => {
                let person = &request.people[0];
                for system in &request.systems {
                    push(
                        Some(*system),
                        format!("{}: {}", system.title(), person.name),
                        Subject::Person {
                            person: person.clone(),
                        },
                    );
                }
            }
            JobKind::Overlay => {
                let (first, second) = (&request.people[0], &request.people[1]);
                for system in &request.systems {
                    for person in [first, second] {
                        push(
                            Some(*system),
                            format!("{}: {}", system.title(), person.name),
                            Subject::Person {
                                person: person.clone(),
                            },
                        );
                    }
                    push(
                        Some(*system),
                        format!("{}: {} & {}", system.title(), first.name, second.name),
                        Subject::Overlay {
                            first: first.clone(),
                            second: second.clone(),
                        },
                    );
                }
                if request.options.verdict {
                    push(
                        None,
                        format!("Verdict: {} & {}", first.name, second.name),
                        Subject::Verdict {
                            first: first.clone(),
                            second: second.clone(),
                        },
                    );
                }
            }
        }

        let mut stages = vec![
            TaskType::TextGeneration,
            TaskType::PdfGeneration,
            TaskType::AudioGeneration,
        ];
        if request.options.songs {
            stages.push(TaskType::SongGeneration);
        }

        Ok(Self { documents, stages })
    }

    /// Every task the job will ever need once all stages have run.
    pub fn expected_tasks(&self) -> u32 {
        (self.documents.len() * self.stages.len()) as u32
    }
}

impl JobRequest {
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.owner_id.trim().is_empty() {
            return Err(PlanError::EmptyOwner);
        }
        if self.systems.is_empty() {
            return Err(PlanError::NoSystems);
        }
        let mut seen = HashSet::new();
        for system in &self.systems {
            if !seen.insert(system) {
                return Err(PlanError::DuplicateSystem(*system));
            }
        }

        let expected = match self.kind {
            JobKind::Individual => 1,
            JobKind::Overlay => 2,
        };
        if self.people.len() != expected {
            return Err(PlanError::WrongPeopleCount {
                kind: self.kind.as_str(),
                expected,
                actual: self.people.len(),
            });
        }
        if self.people.iter().any(|p| p.name.trim().is_empty()) {
            return Err(PlanError::EmptyName);
        }
        if self.options.verdict && self.kind != JobKind::Overlay {
            return Err(PlanError::VerdictWithoutOverlay);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn individual(systems: Vec<System>) -> JobRequest {
        JobRequest {
            owner_id: "user-1".into(),
            kind: JobKind::Individual,
            people: vec![Person::new("Ada")],
            systems,
            voice: None,
            options: JobOptions::default(),
        }
    }

    #[test]
    fn individual_gets_one_document_per_system() {
        let plan =
            DocumentPlan::from_request(&individual(vec![System::Western, System::Vedic])).unwrap();
        assert_eq!(plan.documents.len(), 2);
        assert_eq!(plan.documents[0].number, 1);
        assert_eq!(plan.documents[1].system, Some(System::Vedic));
        assert_eq!(plan.expected_tasks(), 6);
    }

    #[test]
    fn overlay_reads_both_people_and_the_pair() {
        let request = JobRequest {
            kind: JobKind::Overlay,
            people: vec![Person::new("Ada"), Person::new("Alan")],
            options: JobOptions {
                songs: true,
                verdict: true,
            },
            ..individual(vec![System::Kabbalah])
        };
        let plan = DocumentPlan::from_request(&request).unwrap();

        // person, person, overlay, verdict
        assert_eq!(plan.documents.len(), 4);
        assert!(matches!(plan.documents[2].subject, Subject::Overlay { .. }));
        assert!(matches!(plan.documents[3].subject, Subject::Verdict { .. }));
        assert_eq!(plan.documents[3].system, None);
        assert_eq!(plan.stages.len(), 4);
        assert_eq!(plan.expected_tasks(), 16);
    }

    #[test]
    fn rejects_bad_requests() {
        assert_eq!(
            DocumentPlan::from_request(&individual(vec![])),
            Err(PlanError::NoSystems)
        );
        assert_eq!(
            DocumentPlan::from_request(&individual(vec![System::Vedic, System::Vedic])),
            Err(PlanError::DuplicateSystem(System::Vedic))
        );

        let mut pair = individual(vec![System::Western]);
        pair.people.push(Person::new("Alan"));
        assert!(matches!(
            pair.validate(),
            Err(PlanError::WrongPeopleCount { expected: 1, actual: 2, .. })
        ));

        let mut verdict = individual(vec![System::Western]);
        verdict.options.verdict = true;
        assert_eq!(verdict.validate(), Err(PlanError::VerdictWithoutOverlay));
    }

    #[test]
    fn request_round_trips_through_json() {
        let json = serde_json::json!({
            "owner_id": "u",
            "kind": "individual",
            "people": [{"name": "Ada"}],
            "systems": ["human_design"],
        });
        let request: JobRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.systems, vec![System::HumanDesign]);
        assert!(!request.options.songs);
    }
}
