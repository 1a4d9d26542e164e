use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use tt_domain::error::{Error, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pending_captures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    user_message TEXT NOT NULL,
    assistant_response TEXT NOT NULL,
    channel TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    retries INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    sent_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_captures_status_created
    ON pending_captures(status, created_at);

CREATE TABLE IF NOT EXISTS context_cache (
    fingerprint TEXT PRIMARY KEY,
    query TEXT NOT NULL,
    context TEXT NOT NULL,
    fetched_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_context_fetched ON context_cache(fetched_at);
";

pub(crate) fn db_err(e: rusqlite::Error) -> Error {
    Error::Store(e.to_string())
}

/// Shared handle to the process-wide SQLite connection.
///
/// Cloning is cheap. The connection lives behind a `parking_lot::Mutex`
/// and every statement runs synchronously under it, so the lock is never
/// held across an `.await`.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path`, creating parent
    /// directories as needed. Enables WAL with `synchronous=NORMAL`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Store(format!("failed to open database: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| Error::Store(format!("failed to set WAL mode: {e}")))?;
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// In-memory database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Store(format!("failed to create schema: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
