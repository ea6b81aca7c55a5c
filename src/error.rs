//! Error types for story-forge subsystems.
//!
//! Defines error types for the pieces that sit below the pipeline:
//! - LLM provider calls (transport, HTTP status, response parsing)
//! - Moderation service calls
//! - Artifact schema validation
//! - Session state bookkeeping and persistence
//!
//! The pipeline-level taxonomy lives in [`crate::pipeline::error`].

use thiserror::Error;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: LITELLM_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Service unavailable ({code}): {message}")]
    Unavailable { code: u16, message: String },

    #[error("Gateway error ({code}): {message}")]
    Gateway { code: u16, message: String },

    #[error("Content policy violation: {0}")]
    PolicyViolation(String),

    #[error("Context length exceeded: {limit} tokens")]
    ContextLengthExceeded { limit: u32 },

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),
}

impl LlmError {
    /// Classifies an HTTP status code returned by a generation endpoint.
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            429 => LlmError::RateLimited(message),
            500 | 503 => LlmError::Unavailable { code, message },
            502 | 504 => LlmError::Gateway { code, message },
            _ => LlmError::ApiError { code, message },
        }
    }

    /// Classifies a transport-level `reqwest` failure.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(err.to_string())
        } else {
            LlmError::RequestFailed(err.to_string())
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Only rate limiting, unavailability, gateway errors, timeouts and
    /// connection-level failures are transient. Anything describing the
    /// request or the output itself is terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RateLimited(_)
            | LlmError::Unavailable { .. }
            | LlmError::Gateway { .. }
            | LlmError::Timeout(_) => true,
            LlmError::RequestFailed(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("connection")
                    || msg.contains("temporarily")
            }
            _ => false,
        }
    }
}

/// Errors that can occur while talking to the moderation service.
#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("Moderation service not configured: {0}")]
    NotConfigured(String),

    #[error("Moderation service unreachable: {0}")]
    Unreachable(String),

    #[error("Moderation API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Failed to parse moderation response: {0}")]
    ParseError(String),

    #[error("Moderation score out of range: {0}")]
    ScoreOutOfRange(f64),
}

/// Errors raised when a generated value does not conform to its schema.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ArtifactError {
    #[error("Missing or empty field '{field}' in {schema}")]
    MissingField { schema: &'static str, field: String },

    #[error("Field '{field}' in {schema} out of bounds: {reason}")]
    OutOfBounds {
        schema: &'static str,
        field: String,
        reason: String,
    },

    #[error("Invalid value for '{field}' in {schema}: {reason}")]
    InvalidValue {
        schema: &'static str,
        field: String,
        reason: String,
    },

    #[error("Malformed {schema} output: {reason}")]
    Malformed { schema: &'static str, reason: String },

    #[error("Expected a {expected} artifact, got {actual}")]
    KindMismatch {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Errors that can occur while reading or writing session state.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("Artifact '{0}' read before it was written")]
    MissingArtifact(String),

    #[error("Stage '{writer}' cannot overwrite '{key}' written later in the same run by '{owner}'")]
    OwnershipViolation {
        key: String,
        writer: String,
        owner: String,
    },

    #[error("Session store error: {0}")]
    Store(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            LlmError::from_status(429, "slow down"),
            LlmError::RateLimited(_)
        ));
        assert!(matches!(
            LlmError::from_status(503, "down"),
            LlmError::Unavailable { code: 503, .. }
        ));
        assert!(matches!(
            LlmError::from_status(504, "gateway"),
            LlmError::Gateway { code: 504, .. }
        ));
        assert!(matches!(
            LlmError::from_status(400, "bad"),
            LlmError::ApiError { code: 400, .. }
        ));
    }

    #[test]
    fn test_transient_errors() {
        assert!(LlmError::RateLimited("x".to_string()).is_transient());
        assert!(LlmError::Timeout("x".to_string()).is_transient());
        assert!(LlmError::from_status(500, "x").is_transient());
        assert!(LlmError::from_status(502, "x").is_transient());
        assert!(LlmError::RequestFailed("Connection refused".to_string()).is_transient());
    }

    #[test]
    fn test_terminal_errors() {
        assert!(!LlmError::ParseError("bad json".to_string()).is_transient());
        assert!(!LlmError::PolicyViolation("blocked".to_string()).is_transient());
        assert!(!LlmError::from_status(401, "unauthorized").is_transient());
        assert!(!LlmError::MissingApiBase.is_transient());
        assert!(!LlmError::RequestFailed("invalid header value".to_string()).is_transient());
    }
}
