//! Pipeline orchestration for story requests.
//!
//! This module routes a free-form request through one of three stage chains
//! and streams progress events back to the caller.
//!
//! # Architecture
//!
//! The pipeline consists of several components:
//!
//! - **SafetyGate**: moderation check on raw user text, with a fail-open or
//!   fail-closed policy when the moderation service is unavailable
//! - **Router**: classifies the request into CREATE, EDIT or QUESTION
//! - **FanOutStage**: runs independent tasks concurrently, all-or-nothing
//! - **SequentialStage**: runs tasks in order over an accumulating session
//! - **RefinementLoop**: bounded critique and revision state machine
//! - **Orchestrator**: composes the above per mode and owns the event stream
//!
//! # Pipeline Flow
//!
//! 1. **Safety**: the request is screened before anything else sees it
//! 2. **Routing**: a new session goes straight to CREATE, otherwise the router
//!    task decides; unparseable output falls back to QUESTION
//! 3. **CREATE**: intent, then world/character/plot concurrently, then the
//!    draft, then refinement
//! 4. **EDIT**: the editor rewrites the stored draft
//! 5. **QUESTION**: the guide answers from the stored draft without changing it
//! 6. **Save**: the session is written back only when the run succeeded
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use story_forge::llm::{LiteLlmClient, LlmGenerationCapability};
//! use story_forge::pipeline::{PerspectiveModeration, PipelineConfig, PipelineOrchestrator};
//! use story_forge::session::{InMemorySessionStore, SessionKey};
//! use tokio_util::sync::CancellationToken;
//!
//! let provider = Arc::new(LiteLlmClient::from_env()?);
//! let orchestrator = PipelineOrchestrator::builder()
//!     .capability(Arc::new(LlmGenerationCapability::new(provider)))
//!     .moderation(Arc::new(PerspectiveModeration::from_env()?))
//!     .config(PipelineConfig::from_env()?)
//!     .build()?;
//!
//! let store = InMemorySessionStore::new();
//! let key = SessionKey::new("user-1", "session-1");
//! let run = orchestrator
//!     .run("A bedtime story about a sleepy owl", &store, &key, None, CancellationToken::new())
//!     .await;
//!
//! for event in &run.events {
//!     println!("{}", event.event_type());
//! }
//! ```
//!
//! # Configuration
//!
//! ```rust,ignore
//! // Via builder pattern
//! let config = PipelineConfig::new()
//!     .with_max_refinement_iterations(2)
//!     .with_toxicity_threshold(0.6)
//!     .with_fail_open(false);
//!
//! // Via environment variables
//! let config = PipelineConfig::from_env()?;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod fan_out;
pub mod orchestrator;
pub mod refinement;
pub mod router;
pub mod safety;
pub mod sequential;

// Re-export main types for convenience
pub use config::{ConfigError, PipelineConfig};
pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use events::{EventSink, PipelineEvent};
pub use fan_out::{FanOutResults, FanOutStage};
pub use orchestrator::{
    PipelineOrchestrator, PipelineOrchestratorBuilder, PipelineRun, PipelineStats, RunStatus,
};
pub use refinement::{LoopState, RefinementLoop, RefinementOutcome};
pub use router::{Mode, Router, RoutingDecision};
pub use safety::{
    ModerationCapability, PerspectiveModeration, SafetyDecision, SafetyGate, ScreenedText,
};
pub use sequential::{SequentialFailure, SequentialStage, StageOutput};
