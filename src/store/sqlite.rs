//! SQLite-backed [`RecordStore`].

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::migrations;
use super::record::{
    format_timestamp, parse_timestamp, DownloadRecord, DownloadStatus, IncompleteQuery, NewRecord,
    StatusUpdate,
};
use super::RecordStore;
use crate::error::Result;

const RECORD_COLUMNS: &str = "id, catalog_id, source_url, destination_base, status, \
     download_path, file_size, bytes_downloaded, total_bytes, resume_token, retry_count, \
     last_retry_at, locked_at, locked_by, started_at, completed_at, error_message, \
     created_at, updated_at";

/// Record store over a single SQLite connection.
///
/// Several processes may open the same database file; lock coordination
/// relies on SQLite's own write serialization of the conditional updates.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and runs migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        migrations::run_all(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens a private in-memory database. Useful for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::run_all(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn opt_ts(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(format_timestamp)
}

fn opt_u64(value: Option<i64>) -> Option<u64> {
    value.map(|v| v.max(0) as u64)
}

fn read_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<DownloadRecord> {
    let status: String = row.get(4)?;
    let status = status.parse::<DownloadStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
    })?;
    let created_at = read_ts(row, 17)?.unwrap_or_else(Utc::now);
    let updated_at = read_ts(row, 18)?.unwrap_or(created_at);

    Ok(DownloadRecord {
        id: row.get(0)?,
        catalog_id: row.get(1)?,
        source_url: row.get(2)?,
        destination_base: row.get(3)?,
        status,
        download_path: row.get(5)?,
        file_size: opt_u64(row.get(6)?),
        bytes_downloaded: opt_u64(row.get(7)?),
        total_bytes: opt_u64(row.get(8)?),
        resume_token: row.get(9)?,
        retry_count: row.get::<_, i64>(10)?.max(0) as u32,
        last_retry_at: read_ts(row, 11)?,
        locked_at: read_ts(row, 12)?,
        locked_by: row.get(13)?,
        started_at: read_ts(row, 14)?,
        completed_at: read_ts(row, 15)?,
        error_message: row.get(16)?,
        created_at,
        updated_at,
    })
}

fn select_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<DownloadRecord>> {
    conn.query_row(
        &format!("SELECT {} FROM downloads WHERE id = ?1", RECORD_COLUMNS),
        params![id],
        row_to_record,
    )
    .optional()
}

fn select_by_source(
    conn: &Connection,
    source_url: &str,
    destination_base: &str,
) -> rusqlite::Result<Option<DownloadRecord>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM downloads WHERE source_url = ?1 AND destination_base = ?2",
            RECORD_COLUMNS
        ),
        params![source_url, destination_base],
        row_to_record,
    )
    .optional()
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn create(&self, new: NewRecord) -> Result<DownloadRecord> {
        let conn = self.conn();
        let now = format_timestamp(Utc::now());
        conn.execute(
            "INSERT INTO downloads (catalog_id, source_url, destination_base, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                new.catalog_id,
                new.source_url,
                new.destination_base,
                DownloadStatus::Pending.as_str(),
                now
            ],
        )?;
        let id = conn.last_insert_rowid();
        let record = select_by_id(&conn, id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
        Ok(record)
    }

    async fn create_or_get(&self, new: NewRecord) -> Result<(DownloadRecord, bool)> {
        let conn = self.conn();
        let now = format_timestamp(Utc::now());
        let inserted = conn.execute(
            "INSERT INTO downloads (catalog_id, source_url, destination_base, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(source_url, destination_base) DO NOTHING",
            params![
                new.catalog_id,
                new.source_url,
                new.destination_base,
                DownloadStatus::Pending.as_str(),
                now
            ],
        )?;

        let record = match (inserted, &new.source_url, &new.destination_base) {
            (0, Some(url), Some(dest)) => select_by_source(&conn, url, dest)?,
            _ => select_by_id(&conn, conn.last_insert_rowid())?,
        };
        let record = record.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
        Ok((record, inserted > 0))
    }

    async fn get(&self, id: i64) -> Result<Option<DownloadRecord>> {
        Ok(select_by_id(&self.conn(), id)?)
    }

    async fn find_by_source(
        &self,
        source_url: &str,
        destination_base: &str,
    ) -> Result<Option<DownloadRecord>> {
        Ok(select_by_source(&self.conn(), source_url, destination_base)?)
    }

    async fn try_lock(
        &self,
        id: i64,
        owner: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<u64> {
        let now = format_timestamp(now);
        let rows = self.conn().execute(
            "UPDATE downloads SET locked_at = ?1, locked_by = ?2, updated_at = ?1
             WHERE id = ?3 AND (locked_at IS NULL OR locked_at < ?4)",
            params![now, owner, id, format_timestamp(stale_before)],
        )?;
        Ok(rows as u64)
    }

    async fn release_lock(&self, id: i64, owner: &str) -> Result<u64> {
        let rows = self.conn().execute(
            "UPDATE downloads SET locked_at = NULL, locked_by = NULL, updated_at = ?1
             WHERE id = ?2 AND locked_by = ?3",
            params![format_timestamp(Utc::now()), id, owner],
        )?;
        Ok(rows as u64)
    }

    async fn clear_stale_locks(&self, stale_before: DateTime<Utc>) -> Result<u64> {
        let rows = self.conn().execute(
            "UPDATE downloads SET locked_at = NULL, locked_by = NULL
             WHERE locked_at IS NOT NULL AND locked_at < ?1",
            params![format_timestamp(stale_before)],
        )?;
        Ok(rows as u64)
    }

    async fn update_status(&self, id: i64, update: &StatusUpdate) -> Result<u64> {
        let rows = self.conn().execute(
            "UPDATE downloads SET
                 status = ?1,
                 error_message = ?2,
                 started_at = COALESCE(?3, started_at),
                 completed_at = COALESCE(?4, completed_at),
                 retry_count = retry_count + CASE WHEN ?5 IS NULL THEN 0 ELSE 1 END,
                 last_retry_at = COALESCE(?5, last_retry_at),
                 locked_at = CASE WHEN ?6 THEN NULL ELSE locked_at END,
                 locked_by = CASE WHEN ?6 THEN NULL ELSE locked_by END,
                 updated_at = ?7
             WHERE id = ?8",
            params![
                update.status.as_str(),
                update.error_message,
                opt_ts(update.started_at),
                opt_ts(update.completed_at),
                opt_ts(update.retried_at),
                update.clear_lock,
                format_timestamp(update.at),
                id
            ],
        )?;
        Ok(rows as u64)
    }

    async fn update_progress(
        &self,
        id: i64,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let rows = self.conn().execute(
            "UPDATE downloads SET bytes_downloaded = ?1, total_bytes = ?2, updated_at = ?3
             WHERE id = ?4",
            params![
                bytes_downloaded as i64,
                total_bytes.map(|t| t as i64),
                format_timestamp(at),
                id
            ],
        )?;
        Ok(rows as u64)
    }

    async fn complete(
        &self,
        id: i64,
        download_path: &str,
        file_size: u64,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let at = format_timestamp(at);
        let rows = self.conn().execute(
            "UPDATE downloads SET
                 status = ?1,
                 download_path = ?2,
                 file_size = ?3,
                 bytes_downloaded = ?3,
                 total_bytes = ?3,
                 error_message = NULL,
                 completed_at = ?4,
                 locked_at = NULL,
                 locked_by = NULL,
                 updated_at = ?4
             WHERE id = ?5",
            params![
                DownloadStatus::Completed.as_str(),
                download_path,
                file_size as i64,
                at,
                id
            ],
        )?;
        Ok(rows as u64)
    }

    async fn query_incomplete(&self, query: &IncompleteQuery) -> Result<Vec<DownloadRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM downloads
             WHERE status IN ('pending', 'downloading', 'paused', 'failed', 'retrying')
               AND (?1 <= 0 OR retry_count < ?1)
               AND (?2 IS NULL OR locked_at IS NULL OR locked_at < ?2)
             ORDER BY CASE WHEN status = 'failed' THEN 0 ELSE 1 END, updated_at ASC, id ASC
             LIMIT ?3",
            RECORD_COLUMNS
        ))?;

        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let records = stmt
            .query_map(
                params![
                    query.max_retries as i64,
                    query.stale_before.map(format_timestamp),
                    limit
                ],
                row_to_record,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}
