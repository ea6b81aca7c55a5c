//! LLM integration for story-forge.
//!
//! Three layers, bottom-up:
//!
//! - [`LlmProvider`] / [`LiteLlmClient`]: raw chat completions against a
//!   LiteLLM-compatible endpoint, with HTTP failures classified as transient
//!   or terminal.
//! - [`GenerationCapability`] / [`LlmGenerationCapability`]: schema-constrained
//!   generation returning a JSON value extracted from the reply.
//! - [`GenerationClient`]: retry with exponential backoff, per-attempt timeout,
//!   cancellation, and validation into an [`crate::artifacts::Artifact`].
//!
//! ```ignore
//! use std::sync::Arc;
//! use story_forge::llm::{GenerationClient, LiteLlmClient, LlmGenerationCapability, RetryPolicy};
//!
//! let provider = Arc::new(LiteLlmClient::from_env()?);
//! let capability = Arc::new(LlmGenerationCapability::new(provider));
//! let client = GenerationClient::new(capability, RetryPolicy::default());
//! ```

pub mod capability;
pub mod litellm;
pub mod retry;

pub use capability::{GenerationCall, GenerationCapability, LlmGenerationCapability};
pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Usage,
};
pub use retry::{GenerationClient, RetryPolicy};
