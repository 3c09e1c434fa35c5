//! Schema migrations for the download record database.
//!
//! Uses a `schema_version` table to track which migrations have been
//! applied. Each migration runs exactly once.

use chrono::Utc;
use rusqlite::Connection;

use super::record::format_timestamp;

/// Current schema version. Bump this when adding a new migration.
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Returns the current schema version (0 if nothing has been applied).
pub fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

/// Runs all pending migrations. Safe to call on every startup.
pub fn run_all(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         CREATE TABLE IF NOT EXISTS schema_version (
             version INTEGER PRIMARY KEY,
             applied_at TEXT NOT NULL,
             description TEXT NOT NULL
         );",
    )?;

    let current = get_schema_version(conn);

    if current < 1 {
        migration_v1(conn)?;
        record_version(conn, 1, "Initial schema: downloads")?;
    }

    if current < 2 {
        migration_v2(conn)?;
        record_version(conn, 2, "Unique (source_url, destination_base)")?;
    }

    Ok(())
}

fn record_version(
    conn: &Connection,
    version: i32,
    description: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
        rusqlite::params![version, format_timestamp(Utc::now()), description],
    )?;
    Ok(())
}

fn migration_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS downloads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            catalog_id INTEGER,
            source_url TEXT,
            destination_base TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            download_path TEXT,
            file_size INTEGER,
            bytes_downloaded INTEGER,
            total_bytes INTEGER,
            resume_token TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_retry_at TEXT,
            locked_at TEXT,
            locked_by TEXT,
            started_at TEXT,
            completed_at TEXT,
            error_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);
        CREATE INDEX IF NOT EXISTS idx_downloads_source ON downloads(source_url, destination_base);
        CREATE INDEX IF NOT EXISTS idx_downloads_locked_at ON downloads(locked_at);
        ",
    )
}

/// One record per `(source_url, destination_base)`. Older duplicates are
/// dropped, keeping the newest row as the lookup used to.
fn migration_v2(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        DELETE FROM downloads
        WHERE source_url IS NOT NULL
          AND destination_base IS NOT NULL
          AND id NOT IN (
              SELECT MAX(id) FROM downloads
              WHERE source_url IS NOT NULL AND destination_base IS NOT NULL
              GROUP BY source_url, destination_base
          );

        DROP INDEX IF EXISTS idx_downloads_source;
        CREATE UNIQUE INDEX IF NOT EXISTS idx_downloads_source
            ON downloads(source_url, destination_base);
        ",
    )
}
