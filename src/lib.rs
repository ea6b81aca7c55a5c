//! story-forge: multi-agent story generation pipeline.
//!
//! This library routes free-form story requests through a safety check and
//! a classifier, then runs one of three stage chains (create, edit, answer)
//! over a persisted session, streaming progress events to the caller.

// Core modules
pub mod agents;
pub mod artifacts;
pub mod cli;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod session;
pub mod utils;

// Re-export commonly used error types
pub use error::{ArtifactError, LlmError, ModerationError, SessionError};
