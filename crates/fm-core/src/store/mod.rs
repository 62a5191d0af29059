use std::path::Path;
use std::sync::{Once, OnceLock};

use chrono::{DateTime, Utc};
use rusqlite::ffi::sqlite3_auto_extension;
use sqlite_vec::sqlite3_vec_init;
use tokio_rusqlite::Connection;

mod actions;
mod agents;
mod context;
mod locks;
mod messages;
mod rag;
mod sessions;
mod tasks;

pub use tasks::TaskFilter;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("agent '{0}' already exists")]
    AgentExists(String),
    #[error("agent '{0}' not found")]
    AgentNotFound(String),
    #[error("task '{0}' not found")]
    TaskNotFound(String),
    #[error("task '{task_id}' is already assigned to '{owner}'")]
    TaskAlreadyAssigned { task_id: String, owner: String },
    #[error("task '{task_id}' already has parent '{existing_parent}'")]
    TaskParentConflict { task_id: String, existing_parent: String },
    #[error("file '{filepath}' is locked by '{owner}'")]
    LockHeld { filepath: String, owner: String },
    #[error("no active lock on '{filepath}' held by '{agent_id}'")]
    LockNotHeld { filepath: String, agent_id: String },
    #[error("transport session '{0}' not found")]
    SessionNotFound(String),
}

// ---------------------------------------------------------------------------
// Vector extension bootstrap
// ---------------------------------------------------------------------------

static VEC_REGISTER: Once = Once::new();
static VEC_AVAILABLE: OnceLock<bool> = OnceLock::new();

/// Register the bundled sqlite-vec extension for every connection opened
/// after this call. Idempotent.
fn register_vector_extension() {
    VEC_REGISTER.call_once(|| unsafe {
        sqlite3_auto_extension(Some(std::mem::transmute(sqlite3_vec_init as *const ())));
    });
}

/// Probe whether vec0 virtual tables can be created, caching the result
/// process-wide. When this returns `false` the RAG engine stays disabled
/// but everything else keeps working.
pub fn vector_available() -> bool {
    *VEC_AVAILABLE.get_or_init(|| {
        register_vector_extension();
        let probe = || -> rusqlite::Result<()> {
            let conn = rusqlite::Connection::open_in_memory()?;
            conn.execute_batch("CREATE VIRTUAL TABLE probe USING vec0(v float[4])")?;
            Ok(())
        };
        match probe() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "vec0 virtual tables unavailable, RAG disabled");
                false
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// The durable relational store shared by every component.
///
/// One connection is held for the life of the process; every multi-row
/// mutation runs inside a single exclusive transaction through
/// [`Store::call`]-style closures, so a failed handler leaves no partial
/// rows behind.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        register_vector_extension();
        if let Some(dir) = path.as_ref().parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// A purely in-memory store (tests).
    pub async fn open_in_memory() -> Result<Self, CoreError> {
        register_vector_extension();
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Run a closure against the raw connection on the database thread.
    ///
    /// The RAG vector module uses this for vec0 DDL and KNN queries that
    /// have no place in the typed CRUD surface.
    pub async fn call<F, T>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, tokio_rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.conn.call(f).await?)
    }

    async fn init_schema(&self) -> Result<(), CoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA foreign_keys=ON;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS agents (
                        agent_id               TEXT PRIMARY KEY,
                        token                  TEXT NOT NULL UNIQUE,
                        kind                   TEXT NOT NULL DEFAULT 'worker',
                        capabilities           TEXT NOT NULL DEFAULT '[]',
                        status                 TEXT NOT NULL,
                        current_task           TEXT,
                        background_objectives  TEXT,
                        working_directory      TEXT NOT NULL,
                        color                  TEXT NOT NULL,
                        created_at             TEXT NOT NULL,
                        updated_at             TEXT NOT NULL,
                        terminated_at          TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);
                    CREATE INDEX IF NOT EXISTS idx_agents_token  ON agents(token);

                    CREATE TABLE IF NOT EXISTS tasks (
                        task_id          TEXT PRIMARY KEY,
                        title            TEXT NOT NULL,
                        description      TEXT NOT NULL DEFAULT '',
                        assigned_to      TEXT REFERENCES agents(agent_id),
                        created_by       TEXT NOT NULL,
                        status           TEXT NOT NULL,
                        priority         TEXT NOT NULL,
                        parent_task      TEXT,
                        child_tasks      TEXT NOT NULL DEFAULT '[]',
                        depends_on_tasks TEXT NOT NULL DEFAULT '[]',
                        notes            TEXT NOT NULL DEFAULT '[]',
                        created_at       TEXT NOT NULL,
                        updated_at       TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_assigned ON tasks(assigned_to);
                    CREATE INDEX IF NOT EXISTS idx_tasks_status   ON tasks(status);
                    CREATE INDEX IF NOT EXISTS idx_tasks_parent   ON tasks(parent_task);

                    CREATE TABLE IF NOT EXISTS agent_actions (
                        id          INTEGER PRIMARY KEY AUTOINCREMENT,
                        agent_id    TEXT NOT NULL,
                        action_type TEXT NOT NULL,
                        task_id     TEXT,
                        timestamp   TEXT NOT NULL,
                        details     TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_actions_agent ON agent_actions(agent_id, timestamp);

                    CREATE TABLE IF NOT EXISTS admin_config (
                        config_key   TEXT PRIMARY KEY,
                        value        TEXT NOT NULL,
                        description  TEXT,
                        last_updated TEXT NOT NULL,
                        updated_by   TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS project_context (
                        context_key  TEXT PRIMARY KEY,
                        value        TEXT NOT NULL,
                        description  TEXT,
                        last_updated TEXT NOT NULL,
                        updated_by   TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS file_metadata (
                        filepath     TEXT PRIMARY KEY,
                        value        TEXT NOT NULL,
                        description  TEXT,
                        last_updated TEXT NOT NULL,
                        updated_by   TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS rag_chunks (
                        id          INTEGER PRIMARY KEY AUTOINCREMENT,
                        source_type TEXT NOT NULL,
                        source_ref  TEXT NOT NULL,
                        chunk_text  TEXT NOT NULL,
                        indexed_at  TEXT NOT NULL,
                        metadata    TEXT NOT NULL DEFAULT '{}'
                    );

                    CREATE INDEX IF NOT EXISTS idx_chunks_ref ON rag_chunks(source_type, source_ref);

                    CREATE TABLE IF NOT EXISTS rag_meta (
                        meta_key TEXT PRIMARY KEY,
                        value    TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS agent_messages (
                        message_id   TEXT PRIMARY KEY,
                        sender_id    TEXT NOT NULL,
                        recipient_id TEXT NOT NULL,
                        content      TEXT NOT NULL,
                        message_type TEXT NOT NULL,
                        priority     TEXT NOT NULL,
                        timestamp    TEXT NOT NULL,
                        delivered    INTEGER NOT NULL DEFAULT 0,
                        read         INTEGER NOT NULL DEFAULT 0
                    );

                    CREATE INDEX IF NOT EXISTS idx_messages_recipient ON agent_messages(recipient_id, timestamp);

                    CREATE TABLE IF NOT EXISTS file_status (
                        id          INTEGER PRIMARY KEY AUTOINCREMENT,
                        filepath    TEXT NOT NULL,
                        agent_id    TEXT NOT NULL,
                        locked_at   TEXT NOT NULL,
                        released_at TEXT,
                        status      TEXT NOT NULL,
                        notes       TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_file_status_path ON file_status(filepath, status);

                    CREATE TABLE IF NOT EXISTS mcp_sessions (
                        session_id            TEXT PRIMARY KEY,
                        state                 TEXT NOT NULL DEFAULT '{}',
                        status                TEXT NOT NULL,
                        last_heartbeat        TEXT NOT NULL,
                        disconnected_at       TEXT,
                        grace_period_expires  TEXT,
                        recovery_attempts     INTEGER NOT NULL DEFAULT 0
                    );
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(CoreError::from)
    }
}

// ---------------------------------------------------------------------------
// Row helpers — enum / timestamp / list <-> SQLite text
// ---------------------------------------------------------------------------

pub(crate) fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

pub(crate) fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

pub(crate) fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn ts_from_sql(raw: &str) -> DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

pub(crate) fn list_to_sql(items: &[String]) -> String {
    serde_json::to_string(items).expect("serialize string list")
}

pub(crate) fn list_from_sql(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).expect("valid string list")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_initializes_schema() {
        let store = Store::open_in_memory().await.unwrap();
        let count: i64 = store
            .call(|conn| {
                let n = conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='agents'",
                    [],
                    |r| r.get(0),
                )?;
                Ok(n)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".agent").join("foreman.db");
        let _store = Store::open(&path).await.unwrap();
        assert!(path.exists());
    }

    #[test]
    fn vector_probe_is_cached() {
        let first = vector_available();
        let second = vector_available();
        assert_eq!(first, second);
    }

    #[test]
    fn sql_helpers_roundtrip() {
        use crate::types::TaskStatus;
        let raw = enum_to_sql(&TaskStatus::InProgress);
        assert_eq!(raw, "in_progress");
        let back: TaskStatus = enum_from_sql(&raw);
        assert_eq!(back, TaskStatus::InProgress);

        let now = Utc::now();
        let parsed = ts_from_sql(&ts_to_sql(&now));
        assert_eq!(parsed.timestamp(), now.timestamp());

        let list = vec!["a".to_string(), "b".to_string()];
        assert_eq!(list_from_sql(&list_to_sql(&list)), list);
    }
}
