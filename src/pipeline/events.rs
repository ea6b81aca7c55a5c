//! Caller-facing progress events.
//!
//! Events are emitted in pipeline execution order. A successful run ends with
//! exactly one `Complete`, a failed run with exactly one `Error`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::{ErrorKind, PipelineError};
use super::router::Mode;
use crate::artifacts::{Answer, Artifact, Critique, Story};

/// Events emitted during a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Progress of a control step or a completed stage.
    Status {
        stage: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// First draft of a new story.
    Draft {
        story: Story,
        timestamp: DateTime<Utc>,
    },
    /// Critique produced by a refinement iteration.
    Critique {
        /// 1-based iteration number.
        iteration: u32,
        critique: Critique,
        timestamp: DateTime<Utc>,
    },
    /// Revision produced in response to a critique.
    Refined {
        iteration: u32,
        story: Story,
        timestamp: DateTime<Utc>,
    },
    /// Story rewritten on user request.
    Edited {
        story: Story,
        timestamp: DateTime<Utc>,
    },
    /// Answer to a question about the story.
    Answer {
        answer: Answer,
        timestamp: DateTime<Utc>,
    },
    /// Terminal failure.
    Error {
        kind: ErrorKind,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// Terminal success carrying the final artifact.
    Complete {
        mode: Mode,
        artifact: Artifact,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn status(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Status {
            stage: stage.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn draft(story: Story) -> Self {
        Self::Draft {
            story,
            timestamp: Utc::now(),
        }
    }

    pub fn critique(iteration: u32, critique: Critique) -> Self {
        Self::Critique {
            iteration,
            critique,
            timestamp: Utc::now(),
        }
    }

    pub fn refined(iteration: u32, story: Story) -> Self {
        Self::Refined {
            iteration,
            story,
            timestamp: Utc::now(),
        }
    }

    pub fn edited(story: Story) -> Self {
        Self::Edited {
            story,
            timestamp: Utc::now(),
        }
    }

    pub fn answer(answer: Answer) -> Self {
        Self::Answer {
            answer,
            timestamp: Utc::now(),
        }
    }

    pub fn error(err: &PipelineError) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn complete(mode: Mode, artifact: Artifact) -> Self {
        Self::Complete {
            mode,
            artifact,
            timestamp: Utc::now(),
        }
    }

    /// Wire name of the event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Draft { .. } => "draft",
            Self::Critique { .. } => "critique",
            Self::Refined { .. } => "refined",
            Self::Edited { .. } => "edited",
            Self::Answer { .. } => "answer",
            Self::Error { .. } => "error",
            Self::Complete { .. } => "complete",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Complete { .. })
    }
}

/// Records a run's events and forwards them to an optional listener.
///
/// A listener that went away does not fail the run.
#[derive(Debug, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<PipelineEvent>>,
    log: Vec<PipelineEvent>,
}

impl EventSink {
    pub fn new(tx: Option<mpsc::Sender<PipelineEvent>>) -> Self {
        Self {
            tx,
            log: Vec::new(),
        }
    }

    pub async fn emit(&mut self, event: PipelineEvent) {
        tracing::trace!(event_type = event.event_type(), "Emitting pipeline event");
        if let Some(tx) = &self.tx {
            let _ = tx.send(event.clone()).await;
        }
        self.log.push(event);
    }

    pub fn events(&self) -> &[PipelineEvent] {
        &self.log
    }

    pub fn into_events(self) -> Vec<PipelineEvent> {
        self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_survives_dropped_listener() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let mut sink = EventSink::new(Some(tx));
        sink.emit(PipelineEvent::status("safety", "Running safety pre-check...")).await;
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn test_event_serialization() {
        let event = PipelineEvent::status("router", "Mode determined: QUESTION");
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "status");
        assert_eq!(json["stage"], "router");
        assert_eq!(event.event_type(), "status");
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_error_event_carries_kind() {
        let err = PipelineError::SafetyViolation {
            reason: "toxicity 0.90 >= 0.70".to_string(),
            score: Some(0.9),
        };
        let event = PipelineEvent::error(&err);
        assert!(event.is_terminal());
        match event {
            PipelineEvent::Error { kind, message, .. } => {
                assert_eq!(kind, ErrorKind::SafetyViolation);
                assert!(message.contains("toxicity"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
