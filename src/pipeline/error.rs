//! Error taxonomy for pipeline runs.
//!
//! Every failure a caller can observe maps to one [`ErrorKind`], which is what
//! the terminal `error` event carries alongside the human-readable cause.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::config::ConfigError;
use crate::error::{ArtifactError, LlmError, SessionError};

/// Stable classification of a pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Classification,
    SafetyViolation,
    Validation,
    GenerationUnavailable,
    Timeout,
    FanOutAggregate,
    Cancelled,
    Terminal,
    InvalidStage,
    Session,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Classification => "classification",
            ErrorKind::SafetyViolation => "safety_violation",
            ErrorKind::Validation => "validation",
            ErrorKind::GenerationUnavailable => "generation_unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::FanOutAggregate => "fan_out_aggregate",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Terminal => "terminal",
            ErrorKind::InvalidStage => "invalid_stage",
            ErrorKind::Session => "session",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while running a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Router output could not be mapped to a mode.
    #[error("Could not classify request: {reason}")]
    Classification { reason: String },

    /// Moderation blocked the input.
    #[error("Input blocked by safety check: {reason}")]
    SafetyViolation { reason: String, score: Option<f64> },

    /// A generated value failed its schema.
    #[error("Task '{task}' produced invalid output: {source}")]
    Validation {
        task: String,
        #[source]
        source: ArtifactError,
    },

    /// Transient failures persisted through every retry.
    #[error("Generation unavailable for task '{task}' after {attempts} attempts: {last_error}")]
    GenerationUnavailable {
        task: String,
        attempts: u32,
        last_error: String,
    },

    /// A single generation attempt exceeded its deadline.
    #[error("Task '{task}' timed out after {}ms", .timeout.as_millis())]
    Timeout { task: String, timeout: Duration },

    /// One task of a concurrent batch failed; its siblings were cancelled.
    #[error("Fan-out task '{failed_task}' failed (cancelled: [{}]): {source}", .cancelled.join(", "))]
    FanOutAggregate {
        failed_task: String,
        #[source]
        source: Box<PipelineError>,
        cancelled: Vec<String>,
    },

    /// The run was cancelled by its caller.
    #[error("Run cancelled during '{stage}'")]
    Cancelled { stage: String },

    /// The generation capability reported a non-retryable failure.
    #[error("Task '{task}' failed: {source}")]
    Terminal {
        task: String,
        #[source]
        source: LlmError,
    },

    /// A stage was assembled incorrectly.
    #[error("Invalid stage: {0}")]
    InvalidStage(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Classification { .. } => ErrorKind::Classification,
            PipelineError::SafetyViolation { .. } => ErrorKind::SafetyViolation,
            PipelineError::Validation { .. } => ErrorKind::Validation,
            PipelineError::GenerationUnavailable { .. } => ErrorKind::GenerationUnavailable,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
            PipelineError::FanOutAggregate { .. } => ErrorKind::FanOutAggregate,
            PipelineError::Cancelled { .. } => ErrorKind::Cancelled,
            PipelineError::Terminal { .. } => ErrorKind::Terminal,
            PipelineError::InvalidStage(_) => ErrorKind::InvalidStage,
            PipelineError::Session(_) => ErrorKind::Session,
            PipelineError::Config(_) => ErrorKind::Config,
        }
    }

    /// Innermost error kind, looking through fan-out aggregation.
    pub fn root_kind(&self) -> ErrorKind {
        match self {
            PipelineError::FanOutAggregate { source, .. } => source.root_kind(),
            other => other.kind(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.root_kind() == ErrorKind::Cancelled
    }

    pub fn validation(task: impl Into<String>, source: ArtifactError) -> Self {
        PipelineError::Validation {
            task: task.into(),
            source,
        }
    }

    pub fn cancelled(stage: impl Into<String>) -> Self {
        PipelineError::Cancelled {
            stage: stage.into(),
        }
    }
}

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
