//! Durable download record store.
//!
//! The engine talks to the store only through [`RecordStore`]. Every lock
//! operation is a single conditional update whose affected-row count is
//! the success signal, so any number of processes can share one store.

pub mod migrations;
pub mod record;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use record::{
    DownloadRecord, DownloadStatus, IncompleteQuery, NewRecord, StatusUpdate,
};
pub use sqlite::SqliteStore;

/// Persistence operations the download engine needs.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create(&self, new: NewRecord) -> Result<DownloadRecord>;

    /// Atomically return the record for `new`'s `(source, destination)`
    /// pair, inserting it if absent. The flag is true when it was inserted.
    async fn create_or_get(&self, new: NewRecord) -> Result<(DownloadRecord, bool)>;

    async fn get(&self, id: i64) -> Result<Option<DownloadRecord>>;

    /// Look up the record created for a `(source, destination)` pair.
    async fn find_by_source(
        &self,
        source_url: &str,
        destination_base: &str,
    ) -> Result<Option<DownloadRecord>>;

    /// Take the lock if it is free or was taken before `stale_before`.
    async fn try_lock(
        &self,
        id: i64,
        owner: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<u64>;

    /// Clear the lock only if `owner` still holds it.
    async fn release_lock(&self, id: i64, owner: &str) -> Result<u64>;

    /// Clear every lock taken before `stale_before`.
    async fn clear_stale_locks(&self, stale_before: DateTime<Utc>) -> Result<u64>;

    async fn update_status(&self, id: i64, update: &StatusUpdate) -> Result<u64>;

    async fn update_progress(
        &self,
        id: i64,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
        at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Record the final file and enter `completed`, clearing the lock.
    async fn complete(
        &self,
        id: i64,
        download_path: &str,
        file_size: u64,
        at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Incomplete, unlocked-or-stale records, failed first then oldest update.
    async fn query_incomplete(&self, query: &IncompleteQuery) -> Result<Vec<DownloadRecord>>;
}
