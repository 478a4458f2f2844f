//! Chat session persistence behind one store interface.
//!
//! An in-process cache and a SQLite store both implement [`SessionStore`];
//! [`WriteThroughSessionStore`] composes them so every write reaches the
//! persistent store before the cache.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_SESSION_TIMEOUT_SECS: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub farm_id: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub context: Vec<ChatTurn>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("session context encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid timestamp '{0}'")]
    Timestamp(String),
    #[error("session store lock poisoned")]
    LockPoisoned,
    #[error("session not found or expired: {0}")]
    NotFound(String),
}

pub trait SessionStore: Send + Sync {
    fn put(&self, session: &Session) -> Result<(), SessionError>;
    fn get(&self, session_id: &str) -> Result<Option<Session>, SessionError>;
    fn delete(&self, session_id: &str) -> Result<(), SessionError>;
    /// Drops every session whose expiry is at or before `now` and returns
    /// how many were removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, SessionError>;
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for InMemorySessionStore {
    fn put(&self, session: &Session) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().map_err(|_| SessionError::LockPoisoned)?;
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    fn get(&self, session_id: &str) -> Result<Option<Session>, SessionError> {
        let sessions = self.sessions.lock().map_err(|_| SessionError::LockPoisoned)?;
        Ok(sessions.get(session_id).cloned())
    }

    fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().map_err(|_| SessionError::LockPoisoned)?;
        sessions.remove(session_id);
        Ok(())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, SessionError> {
        let mut sessions = self.sessions.lock().map_err(|_| SessionError::LockPoisoned)?;
        let before = sessions.len();
        sessions.retain(|_, session| session.expires_at > now);
        Ok(before - sessions.len())
    }
}

pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    pub fn open(path: &Path) -> Result<Self, SessionError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, SessionError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, SessionError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                farm_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_accessed TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                context TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl SessionStore for SqliteSessionStore {
    fn put(&self, session: &Session) -> Result<(), SessionError> {
        let context = serde_json::to_string(&session.context)?;
        let conn = self.conn.lock().map_err(|_| SessionError::LockPoisoned)?;
        conn.execute(
            "
            INSERT INTO sessions (
                session_id, farm_id, created_at, last_accessed, expires_at, context
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(session_id) DO UPDATE SET
                farm_id = excluded.farm_id,
                last_accessed = excluded.last_accessed,
                expires_at = excluded.expires_at,
                context = excluded.context
            ",
            params![
                session.session_id,
                session.farm_id,
                session.created_at.to_rfc3339(),
                session.last_accessed.to_rfc3339(),
                session.expires_at.to_rfc3339(),
                context,
            ],
        )?;
        Ok(())
    }

    fn get(&self, session_id: &str) -> Result<Option<Session>, SessionError> {
        let conn = self.conn.lock().map_err(|_| SessionError::LockPoisoned)?;
        let row = conn
            .query_row(
                "
                SELECT session_id, farm_id, created_at, last_accessed, expires_at, context
                FROM sessions
                WHERE session_id = ?1
                ",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((session_id, farm_id, created_at, last_accessed, expires_at, context)) = row else {
            return Ok(None);
        };
        Ok(Some(Session {
            session_id,
            farm_id,
            created_at: parse_timestamp(&created_at)?,
            last_accessed: parse_timestamp(&last_accessed)?,
            expires_at: parse_timestamp(&expires_at)?,
            context: serde_json::from_str(&context)?,
        }))
    }

    fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        let conn = self.conn.lock().map_err(|_| SessionError::LockPoisoned)?;
        conn.execute("DELETE FROM sessions WHERE session_id = ?1", params![session_id])?;
        Ok(())
    }

    /// RFC 3339 strings with varying fractional digits do not sort, so
    /// expiry is compared after parsing.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, SessionError> {
        let conn = self.conn.lock().map_err(|_| SessionError::LockPoisoned)?;
        let rows: Vec<(String, String)> = {
            let mut stmt = conn.prepare("SELECT session_id, expires_at FROM sessions")?;
            let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let rows = mapped.collect::<Result<_, _>>()?;
            rows
        };
        let mut purged = 0;
        for (session_id, expires_at) in rows {
            if parse_timestamp(&expires_at)? <= now {
                purged += conn.execute(
                    "DELETE FROM sessions WHERE session_id = ?1",
                    params![session_id],
                )?;
            }
        }
        Ok(purged)
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, SessionError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| SessionError::Timestamp(raw.to_string()))
}

/// Cache in front of a persistent store. Reads fall through to the
/// persistent store on a cache miss and repopulate the cache. Every write
/// first evicts cache entries that expired by the written session's access
/// time, so the cache only holds live sessions.
pub struct WriteThroughSessionStore<C, P> {
    cache: C,
    persistent: P,
}

impl<C: SessionStore, P: SessionStore> WriteThroughSessionStore<C, P> {
    pub fn new(cache: C, persistent: P) -> Self {
        Self { cache, persistent }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn persistent(&self) -> &P {
        &self.persistent
    }
}

impl<C: SessionStore, P: SessionStore> SessionStore for WriteThroughSessionStore<C, P> {
    fn put(&self, session: &Session) -> Result<(), SessionError> {
        self.persistent.put(session)?;
        let evicted = self.cache.purge_expired(session.last_accessed)?;
        if evicted > 0 {
            debug!(component = "session", event = "session.cache.evicted", evicted);
        }
        self.cache.put(session)
    }

    fn get(&self, session_id: &str) -> Result<Option<Session>, SessionError> {
        if let Some(session) = self.cache.get(session_id)? {
            return Ok(Some(session));
        }
        let loaded = self.persistent.get(session_id)?;
        if let Some(session) = &loaded {
            debug!(
                component = "session",
                event = "session.cache.fill",
                session_id = %session.session_id
            );
            self.cache.put(session)?;
        }
        Ok(loaded)
    }

    fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        self.persistent.delete(session_id)?;
        self.cache.delete(session_id)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, SessionError> {
        let purged = self.persistent.purge_expired(now)?;
        self.cache.purge_expired(now)?;
        Ok(purged)
    }
}

pub struct SessionManager<S> {
    store: S,
    timeout: Duration,
}

impl<S: SessionStore> SessionManager<S> {
    pub fn new(store: S) -> Self {
        Self::with_timeout(store, Duration::seconds(DEFAULT_SESSION_TIMEOUT_SECS))
    }

    pub fn with_timeout(store: S, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn create_session(&self, farm_id: &str) -> Result<Session, SessionError> {
        self.create_session_at(farm_id, Utc::now())
    }

    pub fn create_session_at(&self, farm_id: &str, now: DateTime<Utc>) -> Result<Session, SessionError> {
        let session = Session {
            session_id: format!("{farm_id}_{}", uuid::Uuid::new_v4().simple()),
            farm_id: farm_id.to_string(),
            created_at: now,
            last_accessed: now,
            expires_at: now + self.timeout,
            context: Vec::new(),
        };
        self.store.put(&session)?;
        info!(
            component = "session",
            event = "session.created",
            session_id = %session.session_id,
            farm_id
        );
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>, SessionError> {
        self.get_session_at(session_id, Utc::now())
    }

    /// Expired sessions are deleted and reported as absent.
    pub fn get_session_at(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, SessionError> {
        let Some(session) = self.store.get(session_id)? else {
            return Ok(None);
        };
        if now >= session.expires_at {
            self.store.delete(session_id)?;
            info!(
                component = "session",
                event = "session.expired",
                session_id
            );
            return Ok(None);
        }
        Ok(Some(session))
    }

    pub fn purge_expired(&self) -> Result<usize, SessionError> {
        self.purge_expired_at(Utc::now())
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> Result<usize, SessionError> {
        let purged = self.store.purge_expired(now)?;
        if purged > 0 {
            info!(component = "session", event = "session.purged", purged);
        }
        Ok(purged)
    }

    pub fn touch(&self, session_id: &str) -> Result<Session, SessionError> {
        self.touch_at(session_id, Utc::now())
    }

    /// Extends the session's expiry to `now + timeout`.
    pub fn touch_at(&self, session_id: &str, now: DateTime<Utc>) -> Result<Session, SessionError> {
        let mut session = self
            .get_session_at(session_id, now)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.last_accessed = now;
        session.expires_at = now + self.timeout;
        self.store.put(&session)?;
        Ok(session)
    }

    pub fn append_turn(&self, session_id: &str, role: &str, text: &str) -> Result<Session, SessionError> {
        self.append_turn_at(session_id, role, text, Utc::now())
    }

    pub fn append_turn_at(
        &self,
        session_id: &str,
        role: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, SessionError> {
        let mut session = self
            .get_session_at(session_id, now)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.context.push(ChatTurn {
            role: role.to_string(),
            text: text.to_string(),
            at: now,
        });
        session.last_accessed = now;
        session.expires_at = now + self.timeout;
        self.store.put(&session)?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_prefixed_with_farm() {
        let manager = SessionManager::new(InMemorySessionStore::new());
        let session = manager.create_session("farm_7").unwrap();
        assert!(session.session_id.starts_with("farm_7_"));
        assert_eq!(session.session_id.len(), "farm_7_".len() + 32);
        assert_eq!(session.expires_at - session.created_at, Duration::seconds(3600));
    }

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn cache_drops_expired_sessions_on_later_writes() {
        let store = WriteThroughSessionStore::new(
            InMemorySessionStore::new(),
            SqliteSessionStore::open_in_memory().unwrap(),
        );
        let manager = SessionManager::with_timeout(store, Duration::minutes(10));
        let start = at("2025-01-01T00:00:00Z");
        let stale: Vec<Session> = (0..3)
            .map(|i| manager.create_session_at(&format!("f{i}"), start).unwrap())
            .collect();
        assert_eq!(manager.store().cache().len(), 3);

        let later = at("2025-01-01T01:00:00Z");
        let fresh = manager.create_session_at("f9", later).unwrap();
        assert_eq!(manager.store().cache().len(), 1);
        assert!(manager.store().cache().get(&fresh.session_id).unwrap().is_some());
        assert!(manager.store().cache().get(&stale[0].session_id).unwrap().is_none());
        // Persistent rows stay until purged.
        assert!(manager.store().persistent().get(&stale[0].session_id).unwrap().is_some());

        assert_eq!(manager.purge_expired_at(later).unwrap(), 3);
        assert!(manager.store().persistent().get(&stale[1].session_id).unwrap().is_none());
        assert!(manager.get_session_at(&fresh.session_id, later).unwrap().is_some());
    }

    #[test]
    fn purge_keeps_sessions_that_have_not_expired() {
        let manager = SessionManager::with_timeout(
            SqliteSessionStore::open_in_memory().unwrap(),
            Duration::minutes(10),
        );
        let start = at("2025-01-01T00:00:00Z");
        let early = manager.create_session_at("f1", start).unwrap();
        let late = manager
            .create_session_at("f2", at("2025-01-01T00:05:00.250Z"))
            .unwrap();

        assert_eq!(manager.purge_expired_at(at("2025-01-01T00:10:00Z")).unwrap(), 1);
        assert!(manager.store().get(&early.session_id).unwrap().is_none());
        assert!(manager.store().get(&late.session_id).unwrap().is_some());
    }

    #[test]
    fn sqlite_store_round_trips_context() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let now = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let manager = SessionManager::new(store);
        let session = manager.create_session_at("f1", now).unwrap();
        manager
            .append_turn_at(&session.session_id, "user", "when to sow rice?", now)
            .unwrap();

        let loaded = manager.store().get(&session.session_id).unwrap().unwrap();
        assert_eq!(loaded.context.len(), 1);
        assert_eq!(loaded.context[0].text, "when to sow rice?");
        assert_eq!(loaded.created_at, now);
    }
}
