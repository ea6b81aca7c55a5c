//! Per-conversation session state.
//!
//! A `SessionState` maps artifact names ("intent", "world", "draft", ...) to
//! validated artifacts. It is owned by exactly one in-flight run at a time.
//! Writes carry a [`StageStamp`] so that, within one run, an artifact written
//! by a stage can only be overwritten by that stage or a later one.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifacts::{Artifact, SCHEMA_VERSION};
use crate::error::SessionError;

/// Well-known artifact names.
pub mod keys {
    pub const INTENT: &str = "intent";
    pub const WORLD: &str = "world";
    pub const CHARACTER: &str = "character";
    pub const PLOT: &str = "plot";
    pub const DRAFT: &str = "draft";
}

/// Identifies which stage of which run performed a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStamp {
    /// Run that performed the write.
    pub run_id: Uuid,
    /// Position of the stage in that run's execution order.
    pub seq: u32,
    /// Stage name, for diagnostics.
    pub stage: String,
}

impl StageStamp {
    pub fn new(run_id: Uuid, seq: u32, stage: impl Into<String>) -> Self {
        Self {
            run_id,
            seq,
            stage: stage.into(),
        }
    }
}

/// An artifact together with its schema version and writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub artifact: Artifact,
    pub schema_version: u32,
    pub written_by: StageStamp,
    pub written_at: DateTime<Utc>,
}

/// Read-only snapshot of the artifacts a task declared it reads.
pub type Projection = BTreeMap<String, Artifact>;

/// Short description of a session handed to the router.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub has_draft: bool,
    pub draft_title: Option<String>,
    pub artifact_names: Vec<String>,
}

impl SessionSummary {
    /// Renders the summary as prompt context.
    pub fn render(&self) -> String {
        match &self.draft_title {
            Some(title) if self.has_draft => format!(
                "The session has a current story titled \"{}\". Stored artifacts: {}.",
                title,
                self.artifact_names.join(", ")
            ),
            _ if self.artifact_names.is_empty() => {
                "The session is empty: no story has been written yet.".to_string()
            }
            _ => format!(
                "The session has no current story. Stored artifacts: {}.",
                self.artifact_names.join(", ")
            ),
        }
    }
}

/// Mutable mapping from artifact name to validated artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    artifacts: BTreeMap<String, StoredArtifact>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.artifacts.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&StoredArtifact> {
        self.artifacts.get(key)
    }

    pub fn artifact(&self, key: &str) -> Option<&Artifact> {
        self.artifacts.get(key).map(|stored| &stored.artifact)
    }

    /// Reads an artifact that must already exist.
    pub fn read(&self, key: &str) -> Result<&Artifact, SessionError> {
        self.artifact(key)
            .ok_or_else(|| SessionError::MissingArtifact(key.to_string()))
    }

    /// Clones the requested artifacts into a read-only projection.
    ///
    /// Fails on the first key that has not been written yet.
    pub fn project<S: AsRef<str>>(&self, keys: &[S]) -> Result<Projection, SessionError> {
        keys.iter()
            .map(|key| {
                let key = key.as_ref();
                self.read(key).map(|artifact| (key.to_string(), artifact.clone()))
            })
            .collect()
    }

    /// Writes an artifact on behalf of a stage.
    ///
    /// Within one run, a key written by stage `n` may only be overwritten by
    /// stage `n` or a later stage. Artifacts left by previous runs may be
    /// overwritten freely.
    pub fn commit(
        &mut self,
        key: impl Into<String>,
        artifact: Artifact,
        stamp: StageStamp,
    ) -> Result<(), SessionError> {
        let key = key.into();
        if let Some(existing) = self.artifacts.get(&key) {
            let owner = &existing.written_by;
            if owner.run_id == stamp.run_id && owner.seq > stamp.seq {
                return Err(SessionError::OwnershipViolation {
                    key,
                    writer: stamp.stage,
                    owner: owner.stage.clone(),
                });
            }
        }
        self.artifacts.insert(
            key,
            StoredArtifact {
                artifact,
                schema_version: SCHEMA_VERSION,
                written_by: stamp,
                written_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn has_draft(&self) -> bool {
        self.contains(keys::DRAFT)
    }

    /// The current story, if any.
    pub fn draft(&self) -> Option<&crate::artifacts::Story> {
        self.artifact(keys::DRAFT).and_then(Artifact::as_story)
    }

    pub fn summary(&self) -> SessionSummary {
        let draft_title = self.draft().map(|story| story.title.clone());
        SessionSummary {
            has_draft: self.has_draft(),
            draft_title,
            artifact_names: self.artifacts.keys().cloned().collect(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.artifacts.keys().map(String::as_str)
    }
}
