use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::{open_reader, open_writer, JobStore, StoreError, StoreStats};
use crate::models::job::{JobRecord, JobState, JobStatus};

const DEFAULT_READERS: usize = 4;

/// SQLite-backed [`JobStore`].
///
/// A single writer connection serialises inserts, replacements and full-table
/// scans. Point lookups go to a small pool of read-only connections, so they
/// run alongside writes to other keys and always see a committed snapshot.
#[derive(Clone)]
pub struct SqliteJobStore {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    writer: Mutex<Option<Connection>>,
    readers: Vec<Mutex<Option<Connection>>>,
    next_reader: AtomicUsize,
}

impl SqliteJobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_readers(path, DEFAULT_READERS)
    }

    pub fn open_with_readers(path: impl AsRef<Path>, readers: usize) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let writer = open_writer(&path)?;
        let readers = (0..readers.max(1))
            .map(|_| open_reader(&path).map(|conn| Mutex::new(Some(conn))))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(path = %path.display(), readers = readers.len(), "Job store ready");

        Ok(Self {
            inner: Arc::new(Inner {
                path,
                writer: Mutex::new(Some(writer)),
                readers,
                next_reader: AtomicUsize::new(0),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Close every connection. Later operations fail with [`StoreError::Closed`].
    pub fn close(&self) {
        lock(&self.inner.writer).take();
        for reader in &self.inner.readers {
            lock(reader).take();
        }
        tracing::info!(path = %self.inner.path.display(), "Job store closed");
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Inner) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner)).await?
    }
}

impl Inner {
    fn with_writer<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = lock(&self.writer);
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        f(conn)
    }

    fn with_reader<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let slot = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let guard = lock(&self.readers[slot]);
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        f(conn)
    }

    fn upsert(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.with_writer(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO images (id, status, message, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id.to_string(),
                    record.status().to_string(),
                    record.message(),
                    record.payload(),
                    record.created_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RawRow {
    status: String,
    message: String,
    payload: Vec<u8>,
    created_at: i64,
}

fn decode(id: Uuid, row: RawRow) -> Result<JobRecord, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        id: id.to_string(),
        reason,
    };

    let status = JobStatus::from_str(&row.status)
        .map_err(|_| corrupt(format!("unknown status {:?}", row.status)))?;
    let created_at = DateTime::<Utc>::from_timestamp_millis(row.created_at)
        .ok_or_else(|| corrupt(format!("timestamp out of range: {}", row.created_at)))?;

    let state = match status {
        JobStatus::Pending if row.message.is_empty() && row.payload.is_empty() => JobState::Pending,
        JobStatus::Success if row.message.is_empty() && !row.payload.is_empty() => {
            JobState::Success {
                payload: row.payload,
            }
        }
        JobStatus::Failed if row.payload.is_empty() => JobState::Failed {
            message: row.message,
        },
        _ => return Err(corrupt(format!("invalid field combination for {status}"))),
    };

    Ok(JobRecord {
        id,
        state,
        created_at,
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, record: &JobRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.blocking(move |inner| inner.upsert(&record)).await
    }

    async fn save(&self, record: &JobRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.blocking(move |inner| inner.upsert(&record)).await
    }

    async fn find(&self, id: Uuid) -> Result<JobRecord, StoreError> {
        self.blocking(move |inner| {
            let row = inner.with_reader(|conn| {
                conn.query_row(
                    "SELECT status, message, payload, created_at FROM images WHERE id = ?1",
                    params![id.to_string()],
                    |row| {
                        Ok(RawRow {
                            status: row.get(0)?,
                            message: row.get(1)?,
                            payload: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    },
                )
                .optional()
                .map_err(StoreError::from)
            })?;

            match row {
                Some(row) => decode(id, row),
                None => Err(StoreError::NotFound),
            }
        })
        .await
    }

    async fn evict_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff_ms = cutoff.timestamp_millis();
        self.blocking(move |inner| {
            inner.with_writer(|conn| {
                let tx = conn.transaction()?;
                let removed =
                    tx.execute("DELETE FROM images WHERE created_at < ?1", params![cutoff_ms])?;
                tx.commit()?;
                Ok(removed as u64)
            })
        })
        .await
    }

    async fn statistics(&self) -> Result<StoreStats, StoreError> {
        self.blocking(|inner| {
            inner.with_writer(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT status, COUNT(*), COALESCE(SUM(LENGTH(payload)), 0)
                     FROM images GROUP BY status",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?;

                let mut stats = StoreStats::default();
                for row in rows {
                    let (status, count, bytes) = row?;
                    let count = count.max(0) as u64;
                    match JobStatus::from_str(&status) {
                        Ok(JobStatus::Success) => stats.success += count,
                        Ok(JobStatus::Failed) => stats.fail += count,
                        Ok(JobStatus::Pending) => stats.pending += count,
                        Err(_) => {
                            tracing::warn!(status = %status, count, "Skipping unknown status in statistics");
                            continue;
                        }
                    }
                    stats.stored_bytes += bytes.max(0) as u64;
                }
                Ok(stats)
            })
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.blocking(|inner| {
            inner.with_reader(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                Ok(())
            })
        })
        .await
    }
}
