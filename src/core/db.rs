//! SQLite persistence for checkpoint sessions and execution state.
//!
//! Both tables store the full record as a JSON `body` next to the few
//! columns that are queried on. Timestamps are RFC 3339 UTC with fixed
//! microsecond precision so they compare correctly as text.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::domain::{ActionKind, CheckpointSession, PipelineState, SessionScope};

/// Async-safe handle to the database.
///
/// All access runs on tokio's blocking pool via `spawn_blocking`.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<std::sync::Mutex<Database>>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open (or create) the database file and run migrations
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Database) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub(crate) fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS checkpoint_sessions (
                session_id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                paused_stage TEXT NOT NULL,
                saved_at TEXT,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                body TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_execution
                ON checkpoint_sessions(execution_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_saved
                ON checkpoint_sessions(tenant_id, saved_at);

            CREATE TABLE IF NOT EXISTS executions (
                execution_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                body TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── Checkpoint sessions ──────────────────────────────────────────

    pub fn insert_session(&self, session: &CheckpointSession) -> Result<()> {
        let body = serde_json::to_string(session).context("Failed to serialize session")?;
        self.conn
            .execute(
                "INSERT INTO checkpoint_sessions
                    (session_id, execution_id, tenant_id, user_id, paused_stage,
                     saved_at, expires_at, created_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    session.session_id,
                    session.execution_id.to_string(),
                    session.identity.tenant_id,
                    session.identity.user_id,
                    session.paused_stage.as_str(),
                    session.saved_at.map(ts),
                    ts(session.expires_at),
                    ts(session.created_at),
                    body,
                ],
            )
            .context("Failed to insert checkpoint session")?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<CheckpointSession>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM checkpoint_sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| parse_session(&b)).transpose()
    }

    /// Delete and return the session; `None` if it was already gone
    pub fn consume_session(&self, session_id: &str) -> Result<Option<CheckpointSession>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "DELETE FROM checkpoint_sessions WHERE session_id = ?1 RETURNING body",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to consume checkpoint session")?;
        body.map(|b| parse_session(&b)).transpose()
    }

    /// Flip a live session to saved; `None` if it was consumed or already saved
    pub fn mark_session_saved(
        &self,
        session_id: &str,
        instructions: Option<String>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<CheckpointSession>> {
        let Some(mut session) = self.get_session(session_id)? else {
            return Ok(None);
        };
        if session.is_saved() {
            return Ok(None);
        }

        session.pending_action = Some(ActionKind::Save);
        session.saved_at = Some(now);
        session.expires_at = expires_at;
        if instructions.is_some() {
            session.instructions = instructions;
        }
        let body = serde_json::to_string(&session).context("Failed to serialize session")?;

        let updated = self
            .conn
            .execute(
                "UPDATE checkpoint_sessions
                 SET saved_at = ?1, expires_at = ?2, body = ?3
                 WHERE session_id = ?4 AND saved_at IS NULL",
                params![ts(now), ts(expires_at), body, session_id],
            )
            .context("Failed to mark checkpoint session saved")?;

        Ok((updated == 1).then_some(session))
    }

    pub fn find_session_by_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<CheckpointSession>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM checkpoint_sessions
                 WHERE execution_id = ?1
                 ORDER BY created_at DESC LIMIT 1",
                params![execution_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| parse_session(&b)).transpose()
    }

    pub fn list_saved_sessions(
        &self,
        scope: &SessionScope,
        now: DateTime<Utc>,
    ) -> Result<Vec<CheckpointSession>> {
        let mut stmt = self.conn.prepare(
            "SELECT body FROM checkpoint_sessions
             WHERE saved_at IS NOT NULL
               AND tenant_id = ?1
               AND (?2 IS NULL OR user_id = ?2)
               AND expires_at > ?3
             ORDER BY saved_at DESC",
        )?;
        let rows = stmt.query_map(
            params![scope.tenant_id, scope.user_id, ts(now)],
            |row| row.get::<_, String>(0),
        )?;

        let mut sessions = Vec::new();
        for body in rows {
            sessions.push(parse_session(&body?)?);
        }
        Ok(sessions)
    }

    /// Delete expired sessions, returning what was deleted
    pub fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<Vec<CheckpointSession>> {
        let mut stmt = self
            .conn
            .prepare("DELETE FROM checkpoint_sessions WHERE expires_at <= ?1 RETURNING body")
            .context("Failed to purge expired sessions")?;
        let rows = stmt.query_map(params![ts(now)], |row| row.get::<_, String>(0))?;

        let mut purged = Vec::new();
        for body in rows {
            purged.push(parse_session(&body?)?);
        }
        Ok(purged)
    }

    // ── Execution state ──────────────────────────────────────────────

    pub fn put_state(&self, state: &PipelineState) -> Result<()> {
        let body = serde_json::to_string(state).context("Failed to serialize state")?;
        self.conn
            .execute(
                "INSERT INTO executions
                    (execution_id, tenant_id, user_id, status, created_at, updated_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(execution_id) DO UPDATE SET
                    status = excluded.status,
                    updated_at = excluded.updated_at,
                    body = excluded.body",
                params![
                    state.execution_id.to_string(),
                    state.request.identity.tenant_id,
                    state.request.identity.user_id,
                    state.status.as_str(),
                    ts(state.created_at),
                    ts(state.updated_at),
                    body,
                ],
            )
            .context("Failed to store execution state")?;
        Ok(())
    }

    pub fn get_state(&self, execution_id: Uuid) -> Result<Option<PipelineState>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM executions WHERE execution_id = ?1",
                params![execution_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| parse_state(&b)).transpose()
    }

    /// Most recently updated first
    pub fn list_states(&self, limit: usize) -> Result<Vec<PipelineState>> {
        let mut stmt = self.conn.prepare(
            "SELECT body FROM executions ORDER BY updated_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;

        let mut states = Vec::new();
        for body in rows {
            states.push(parse_state(&body?)?);
        }
        Ok(states)
    }
}

fn parse_session(body: &str) -> Result<CheckpointSession> {
    serde_json::from_str(body).context("Failed to parse stored checkpoint session")
}

fn parse_state(body: &str) -> Result<PipelineState> {
    serde_json::from_str(body).context("Failed to parse stored execution state")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ContentRequest, ExecutionMode, Identity, StageId};
    use chrono::Duration;

    fn session(tenant: &str, user: &str) -> CheckpointSession {
        let state = PipelineState::new(
            Uuid::new_v4(),
            ContentRequest::new("topic", Identity::new(tenant, user)),
            ExecutionMode::Checkpoint,
        );
        CheckpointSession::new(state, StageId::Research, StageId::ToneAnalysis, Duration::hours(1))
    }

    #[test]
    fn test_timestamps_sort_as_text() {
        let earlier = Utc::now();
        let later = earlier + Duration::microseconds(1);
        assert!(ts(earlier) < ts(later));
        assert!(ts(earlier).ends_with('Z'));
    }

    #[test]
    fn test_consume_is_single_use() {
        let db = Database::open_in_memory().unwrap();
        let s = session("acme", "u1");
        db.insert_session(&s).unwrap();

        assert_eq!(db.get_session(&s.session_id).unwrap(), Some(s.clone()));
        assert_eq!(db.consume_session(&s.session_id).unwrap(), Some(s.clone()));
        assert_eq!(db.consume_session(&s.session_id).unwrap(), None);
        assert_eq!(db.get_session(&s.session_id).unwrap(), None);
    }

    #[test]
    fn test_mark_saved_once() {
        let db = Database::open_in_memory().unwrap();
        let s = session("acme", "u1");
        db.insert_session(&s).unwrap();

        let now = Utc::now();
        let saved = db
            .mark_session_saved(&s.session_id, Some("shorter".into()), now, now + Duration::days(7))
            .unwrap()
            .unwrap();
        assert!(saved.is_saved());
        assert_eq!(saved.instructions.as_deref(), Some("shorter"));

        assert!(db
            .mark_session_saved(&s.session_id, None, now, now + Duration::days(7))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_list_saved_is_scoped() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        for (tenant, user) in [("acme", "u1"), ("acme", "u2"), ("globex", "u1")] {
            let s = session(tenant, user);
            db.insert_session(&s).unwrap();
            db.mark_session_saved(&s.session_id, None, now, now + Duration::days(1))
                .unwrap();
        }
        db.insert_session(&session("acme", "u1")).unwrap();

        assert_eq!(
            db.list_saved_sessions(&SessionScope::tenant("acme"), now)
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            db.list_saved_sessions(&SessionScope::user("acme", "u2"), now)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_purge_expired() {
        let db = Database::open_in_memory().unwrap();
        let s = session("acme", "u1");
        db.insert_session(&s).unwrap();

        assert!(db.purge_expired_sessions(Utc::now()).unwrap().is_empty());

        let purged = db
            .purge_expired_sessions(Utc::now() + Duration::hours(2))
            .unwrap();
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].session_id, s.session_id);
        assert!(db.get_session(&s.session_id).unwrap().is_none());
    }

    #[test]
    fn test_state_upsert_and_list() {
        let db = Database::open_in_memory().unwrap();
        let mut state = PipelineState::new(
            Uuid::new_v4(),
            ContentRequest::new("topic", Identity::new("acme", "u1")),
            ExecutionMode::Automatic,
        );
        db.put_state(&state).unwrap();
        state.complete();
        db.put_state(&state).unwrap();

        let loaded = db.get_state(state.execution_id).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(db.list_states(10).unwrap().len(), 1);
    }
}
