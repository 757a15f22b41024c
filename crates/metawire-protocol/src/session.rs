//! Sessions: token-addressed mutable state with write-through persistence.
//!
//! [`SessionState`] is an explicit get/set wrapper. Every write schedules a
//! save of the full snapshot through the host's [`SessionStore`]; save
//! failures are logged and never reach the caller. Reads never save.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error};

/// Session data as persisted.
pub type SessionData = Map<String, Value>;

/// Persistence failure reported by a [`SessionStore`].
#[derive(Debug, Error)]
#[error("session save failed: {0}")]
pub struct SessionStoreError(pub String);

/// Host-supplied persistence for session state.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist the full state of the session `token`.
    async fn save(&self, token: &str, data: &SessionData) -> Result<(), SessionStoreError>;
}

/// Store that discards every save.
#[derive(Debug, Default)]
pub struct NoopSessionStore;

#[async_trait]
impl SessionStore for NoopSessionStore {
    async fn save(&self, _token: &str, _data: &SessionData) -> Result<(), SessionStoreError> {
        Ok(())
    }
}

/// In-process store keeping the last saved snapshot per token.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    saved: Mutex<std::collections::HashMap<String, SessionData>>,
}

impl MemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last snapshot saved for `token`.
    pub fn load(&self, token: &str) -> Option<SessionData> {
        self.saved.lock().get(token).cloned()
    }

    /// Number of tokens with a saved snapshot.
    pub fn len(&self) -> usize {
        self.saved.lock().len()
    }

    /// Whether nothing was saved yet.
    pub fn is_empty(&self) -> bool {
        self.saved.lock().is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, token: &str, data: &SessionData) -> Result<(), SessionStoreError> {
        let _ = self.saved.lock().insert(token.to_owned(), data.clone());
        Ok(())
    }
}

/// Mutable session state that persists on every write.
pub struct SessionState {
    token: String,
    data: RwLock<SessionData>,
    store: Arc<dyn SessionStore>,
}

impl SessionState {
    fn new(token: String, data: SessionData, store: Arc<dyn SessionStore>) -> Self {
        Self {
            token,
            data: RwLock::new(data),
            store,
        }
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    /// Copy of the whole state.
    pub fn snapshot(&self) -> SessionData {
        self.data.read().clone()
    }

    /// Store `value` under `key` and schedule a save.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let snapshot = {
            let mut data = self.data.write();
            let _ = data.insert(key.into(), value);
            data.clone()
        };
        self.persist(snapshot);
    }

    /// Remove `key` and schedule a save. Returns the previous value.
    pub fn remove(&self, key: &str) -> Option<Value> {
        let (previous, snapshot) = {
            let mut data = self.data.write();
            let previous = data.remove(key);
            (previous, data.clone())
        };
        self.persist(snapshot);
        previous
    }

    /// Replace the whole state and schedule a save.
    pub fn replace(&self, data: SessionData) {
        *self.data.write() = data.clone();
        self.persist(data);
    }

    fn persist(&self, snapshot: SessionData) {
        let store = self.store.clone();
        let token = self.token.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(token, "no runtime available, session not saved");
            return;
        };
        drop(runtime.spawn(async move {
            match store.save(&token, &snapshot).await {
                Ok(()) => debug!(token, "session saved"),
                Err(err) => error!(token, error = %err, "session save failed"),
            }
        }));
    }
}

/// A token-identified session.
pub struct Session {
    token: String,
    state: SessionState,
}

impl Session {
    /// Create a session with initial `data`.
    pub fn new(token: impl Into<String>, data: SessionData, store: Arc<dyn SessionStore>) -> Self {
        let token = token.into();
        Self {
            state: SessionState::new(token.clone(), data, store),
            token,
        }
    }

    /// Opaque session token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Mutable state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Process-wide token → session map. At most one session per token.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session`, replacing any session with the same token.
    pub fn insert(&self, session: Arc<Session>) {
        let _ = self.sessions.insert(session.token().to_owned(), session);
    }

    /// Session registered under `token`.
    pub fn get(&self, token: &str) -> Option<Arc<Session>> {
        self.sessions.get(token).map(|entry| entry.value().clone())
    }

    /// Unregister `token`.
    pub fn remove(&self, token: &str) -> Option<Arc<Session>> {
        self.sessions.remove(token).map(|(_, session)| session)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    struct FailingStore;

    #[async_trait]
    impl SessionStore for FailingStore {
        async fn save(&self, _token: &str, _data: &SessionData) -> Result<(), SessionStoreError> {
            Err(SessionStoreError("disk full".into()))
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn set_persists_full_snapshot() {
        let store = Arc::new(MemorySessionStore::new());
        let session = Session::new("t1", SessionData::new(), store.clone());
        session.state().set("user", json!("max"));
        session.state().set("visits", json!(3));
        settle().await;

        let saved = store.load("t1").unwrap();
        assert_eq!(saved["user"], "max");
        assert_eq!(saved["visits"], 3);
    }

    #[tokio::test]
    async fn reads_do_not_persist() {
        let store = Arc::new(MemorySessionStore::new());
        let mut data = SessionData::new();
        let _ = data.insert("user".into(), json!("max"));
        let session = Session::new("t1", data, store.clone());

        assert_eq!(session.state().get("user"), Some(json!("max")));
        assert!(session.state().contains("user"));
        let _ = session.state().snapshot();
        settle().await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn remove_persists() {
        let store = Arc::new(MemorySessionStore::new());
        let session = Session::new("t1", SessionData::new(), store.clone());
        session.state().set("a", json!(1));
        assert_eq!(session.state().remove("a"), Some(json!(1)));
        settle().await;
        assert!(store.load("t1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_failure_does_not_reach_caller() {
        let session = Session::new("t1", SessionData::new(), Arc::new(FailingStore));
        session.state().set("a", json!(1));
        settle().await;
        assert_eq!(session.state().get("a"), Some(json!(1)));
    }

    #[test]
    fn registry_holds_one_session_per_token() {
        let registry = SessionRegistry::new();
        let store: Arc<dyn SessionStore> = Arc::new(NoopSessionStore);
        let first = Arc::new(Session::new("tok", SessionData::new(), store.clone()));
        let second = Arc::new(Session::new("tok", SessionData::new(), store));
        registry.insert(first);
        registry.insert(second.clone());
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get("tok").unwrap(), &second));
    }

    #[test]
    fn registry_remove() {
        let registry = SessionRegistry::new();
        let session = Arc::new(Session::new(
            "tok",
            SessionData::new(),
            Arc::new(NoopSessionStore),
        ));
        registry.insert(session);
        assert!(registry.remove("tok").is_some());
        assert!(registry.get("tok").is_none());
        assert!(registry.is_empty());
    }
}
