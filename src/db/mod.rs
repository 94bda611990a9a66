use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::JobRecord;

pub mod store;

pub use store::SqliteJobStore;

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS images (
    id          TEXT PRIMARY KEY NOT NULL,
    status      TEXT NOT NULL,
    message     TEXT NOT NULL DEFAULT '',
    payload     BLOB NOT NULL DEFAULT x'',
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS images_created_at ON images (created_at);
"#;

/// Persistent job record storage.
///
/// Implementations own their records exclusively: callers only ever receive
/// copies, and a record changes in storage only through `create` or `save`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record. An identifier collision overwrites the existing row.
    async fn create(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// Replace the record with the same identifier, atomically.
    async fn save(&self, record: &JobRecord) -> Result<(), StoreError>;

    async fn find(&self, id: Uuid) -> Result<JobRecord, StoreError>;

    /// Remove every record created strictly before `cutoff`, in one transaction.
    async fn evict_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Remove every record older than `retention`.
    async fn evict_older_than(&self, retention: Duration) -> Result<u64, StoreError> {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.evict_created_before(cutoff).await
    }

    /// Record counts by status, from a full scan.
    async fn statistics(&self) -> Result<StoreStats, StoreError>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub success: u64,
    pub fail: u64,
    pub pending: u64,
    /// Sum of stored image payload sizes.
    pub stored_bytes: u64,
}

impl StoreStats {
    pub fn total(&self) -> u64 {
        self.success + self.fail + self.pending
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("image not found")]
    NotFound,

    #[error("store is closed")]
    Closed,

    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Open the read-write connection and apply pragmas and schema.
pub fn open_writer(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // WAL lets readers keep a consistent snapshot while a write commits.
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))?;
    tracing::debug!(path = %path.display(), journal_mode = %mode, "Opened job store");
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Open a read-only connection to an existing store.
pub fn open_reader(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}
