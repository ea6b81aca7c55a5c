//! Session persistence across conversation turns.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::state::SessionState;
use crate::error::SessionError;

/// Addresses one conversation of one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.session_id)
    }
}

/// Opaque key-value persistence of [`SessionState`].
///
/// The orchestrator only needs get/put. Backends decide durability.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Loads the state for `key`, or `None` for a new conversation.
    async fn get(&self, key: &SessionKey) -> Result<Option<SessionState>, SessionError>;

    /// Replaces the stored state for `key`.
    async fn put(&self, key: &SessionKey, state: SessionState) -> Result<(), SessionError>;
}

/// Process-local store, suitable for the CLI and tests.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionKey, SessionState>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, key: &SessionKey) -> Result<Option<SessionState>, SessionError> {
        Ok(self.sessions.read().await.get(key).cloned())
    }

    async fn put(&self, key: &SessionKey, state: SessionState) -> Result<(), SessionError> {
        self.sessions.write().await.insert(key.clone(), state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{Answer, Artifact};
    use crate::session::StageStamp;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_get_missing_session() {
        let store = InMemorySessionStore::new();
        let key = SessionKey::new("user", "s1");
        assert!(store.get(&key).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_put_then_get_is_isolated_by_key() {
        let store = InMemorySessionStore::new();
        let mut state = SessionState::new();
        state
            .commit(
                "answer",
                Artifact::Answer(Answer {
                    text: "hello".to_string(),
                }),
                StageStamp::new(Uuid::new_v4(), 0, "guide"),
            )
            .expect("commit");

        let key = SessionKey::new("user", "s1");
        store.put(&key, state.clone()).await.expect("put");

        assert_eq!(store.get(&key).await.expect("get"), Some(state));
        assert!(store
            .get(&SessionKey::new("user", "s2"))
            .await
            .expect("get")
            .is_none());
        assert!(store
            .get(&SessionKey::new("other", "s1"))
            .await
            .expect("get")
            .is_none());
        assert_eq!(store.len().await, 1);
    }

    #[test]
    fn test_session_key_display() {
        assert_eq!(SessionKey::new("u1", "abc").to_string(), "u1/abc");
    }
}
