//! Request classification into a pipeline mode.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{PipelineError, PipelineResult};
use super::safety::ScreenedText;
use crate::agents::{GenerationTask, TaskContext, TaskInput};
use crate::error::LlmError;
use crate::session::SessionSummary;

/// Processing route selected for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Create,
    Edit,
    Question,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Create => "CREATE",
            Mode::Edit => "EDIT",
            Mode::Question => "QUESTION",
        }
    }

    /// Maps a classifier token to a mode.
    ///
    /// Accepts the classifier vocabulary (`NEW_STORY`, `EDIT_STORY`,
    /// `QUESTION`) and the mode names, case-insensitively. Anything else is
    /// rejected rather than guessed.
    pub fn from_decision(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "NEW_STORY" | "CREATE" => Some(Mode::Create),
            "EDIT_STORY" | "EDIT" => Some(Mode::Edit),
            "QUESTION" => Some(Mode::Question),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Router output for one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Classifies a request with a single generation task.
#[derive(Clone)]
pub struct Router {
    task: Arc<dyn GenerationTask>,
    route_new_sessions_to_create: bool,
}

impl Router {
    pub fn new(task: Arc<dyn GenerationTask>) -> Self {
        Self {
            task,
            route_new_sessions_to_create: true,
        }
    }

    /// When on, a session without a draft is routed to CREATE without a call.
    pub fn with_new_session_shortcut(mut self, enabled: bool) -> Self {
        self.route_new_sessions_to_create = enabled;
        self
    }

    pub fn task_name(&self) -> &str {
        self.task.name()
    }

    /// Whether `classify` would skip the classifier call for this session.
    pub fn shortcut_applies(&self, summary: &SessionSummary) -> bool {
        self.route_new_sessions_to_create && !summary.has_draft
    }

    /// Classifies `text` against the session described by `summary`.
    ///
    /// # Errors
    ///
    /// - `Classification` if the output is malformed or names no known mode
    /// - any other pipeline error (unavailable, cancelled) unchanged
    pub async fn classify(
        &self,
        text: &ScreenedText,
        summary: &SessionSummary,
        ctx: &TaskContext,
    ) -> PipelineResult<RoutingDecision> {
        if self.shortcut_applies(summary) {
            tracing::debug!(run_id = %ctx.run_id, "No current story, routing to CREATE");
            return Ok(RoutingDecision {
                mode: Mode::Create,
                confidence: Some(1.0),
            });
        }

        let input = TaskInput::default()
            .with_user_text(text.as_str())
            .with_extra("session", Value::String(summary.render()));

        let artifact = match self.task.invoke(ctx, input).await {
            Ok(artifact) => artifact,
            Err(PipelineError::Validation { source, .. }) => {
                return Err(PipelineError::Classification {
                    reason: source.to_string(),
                })
            }
            Err(PipelineError::Terminal {
                source: LlmError::ParseError(reason),
                ..
            }) => return Err(PipelineError::Classification { reason }),
            Err(other) => return Err(other),
        };

        let routing = artifact
            .as_routing()
            .ok_or_else(|| PipelineError::Classification {
                reason: format!("router produced a {} artifact", artifact.kind()),
            })?;

        let mode =
            Mode::from_decision(&routing.decision).ok_or_else(|| PipelineError::Classification {
                reason: format!("unknown routing decision '{}'", routing.decision),
            })?;

        tracing::info!(
            run_id = %ctx.run_id,
            mode = %mode,
            confidence = routing.confidence.unwrap_or(0.0),
            "Request classified"
        );
        Ok(RoutingDecision {
            mode,
            confidence: routing.confidence,
        })
    }
}
