//! Session state and its persistence.
//!
//! [`SessionState`] is the run-local accumulator the stages read from and
//! commit to. [`SessionStore`] persists it between turns of a conversation;
//! the orchestrator receives a store handle per call instead of reaching for
//! a process-wide cache.

pub mod state;
pub mod store;

pub use state::{
    keys, Projection, SessionState, SessionSummary, StageStamp, StoredArtifact,
};
pub use store::{InMemorySessionStore, SessionKey, SessionStore};
