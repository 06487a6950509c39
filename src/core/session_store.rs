//! Checkpoint session storage.
//!
//! A session is created when an execution pauses and is consumed exactly
//! once when an action continues or cancels it. `consume` is the only
//! way a session leaves the live set, and at most one caller ever gets it.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::db::SqliteStore;
use crate::domain::{ActionKind, CheckpointSession, SessionScope};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session
    async fn create(&self, session: &CheckpointSession) -> Result<()>;

    async fn get(&self, session_id: &str) -> Result<Option<CheckpointSession>>;

    /// Atomically remove and return the session.
    ///
    /// Of any number of concurrent callers, exactly one gets `Some`.
    async fn consume(&self, session_id: &str) -> Result<Option<CheckpointSession>>;

    /// Park a live session for later, extending its expiry to `now + ttl`.
    ///
    /// Returns `None` if the session is gone or already saved.
    async fn mark_saved(
        &self,
        session_id: &str,
        instructions: Option<String>,
        ttl: Duration,
    ) -> Result<Option<CheckpointSession>>;

    /// The session an execution is currently paused on
    async fn find_by_execution(&self, execution_id: Uuid) -> Result<Option<CheckpointSession>>;

    /// Unexpired saved sessions in scope, most recently saved first
    async fn list_saved(&self, scope: &SessionScope) -> Result<Vec<CheckpointSession>>;

    /// Remove and return sessions whose expiry is at or before `now`
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<CheckpointSession>>;
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create(&self, session: &CheckpointSession) -> Result<()> {
        let session = session.clone();
        self.call(move |db| db.insert_session(&session)).await
    }

    async fn get(&self, session_id: &str) -> Result<Option<CheckpointSession>> {
        let id = session_id.to_string();
        self.call(move |db| db.get_session(&id)).await
    }

    async fn consume(&self, session_id: &str) -> Result<Option<CheckpointSession>> {
        let id = session_id.to_string();
        self.call(move |db| db.consume_session(&id)).await
    }

    async fn mark_saved(
        &self,
        session_id: &str,
        instructions: Option<String>,
        ttl: Duration,
    ) -> Result<Option<CheckpointSession>> {
        let id = session_id.to_string();
        let now = Utc::now();
        self.call(move |db| db.mark_session_saved(&id, instructions, now, now + ttl))
            .await
    }

    async fn find_by_execution(&self, execution_id: Uuid) -> Result<Option<CheckpointSession>> {
        self.call(move |db| db.find_session_by_execution(execution_id))
            .await
    }

    async fn list_saved(&self, scope: &SessionScope) -> Result<Vec<CheckpointSession>> {
        let scope = scope.clone();
        self.call(move |db| db.list_saved_sessions(&scope, Utc::now()))
            .await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<CheckpointSession>> {
        self.call(move |db| db.purge_expired_sessions(now)).await
    }
}

/// Process-local session store
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, CheckpointSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: &CheckpointSession) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&session.session_id) {
            anyhow::bail!("checkpoint session {} already exists", session.session_id);
        }
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<CheckpointSession>> {
        Ok(self.sessions.lock().await.get(session_id).cloned())
    }

    async fn consume(&self, session_id: &str) -> Result<Option<CheckpointSession>> {
        Ok(self.sessions.lock().await.remove(session_id))
    }

    async fn mark_saved(
        &self,
        session_id: &str,
        instructions: Option<String>,
        ttl: Duration,
    ) -> Result<Option<CheckpointSession>> {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return Ok(None);
        };
        if session.is_saved() {
            return Ok(None);
        }

        let now = Utc::now();
        session.pending_action = Some(ActionKind::Save);
        session.saved_at = Some(now);
        session.expires_at = now + ttl;
        if instructions.is_some() {
            session.instructions = instructions;
        }
        Ok(Some(session.clone()))
    }

    async fn find_by_execution(&self, execution_id: Uuid) -> Result<Option<CheckpointSession>> {
        Ok(self
            .sessions
            .lock()
            .await
            .values()
            .filter(|s| s.execution_id == execution_id)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn list_saved(&self, scope: &SessionScope) -> Result<Vec<CheckpointSession>> {
        let now = Utc::now();
        let mut saved: Vec<CheckpointSession> = self
            .sessions
            .lock()
            .await
            .values()
            .filter(|s| s.is_saved() && !s.is_expired(now) && scope.matches(&s.identity))
            .cloned()
            .collect();
        saved.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(saved)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<CheckpointSession>> {
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.session_id.clone())
            .collect();
        Ok(expired
            .iter()
            .filter_map(|id| sessions.remove(id))
            .collect())
    }
}
