//! Download lifecycle and advisory lock management.
//!
//! [`StateManager`] is the only component that mutates download records.
//! Locks live in the store, not in memory, so they coordinate every
//! process sharing the same database.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::download::job::DownloadJob;
use crate::error::{Error, Result};
use crate::store::{
    DownloadRecord, DownloadStatus, IncompleteQuery, NewRecord, RecordStore, StatusUpdate,
};

/// Persist a checkpoint after this many new bytes (10 MiB).
pub const DEFAULT_PROGRESS_BYTES: u64 = 10 * 1024 * 1024;

/// ... or after this much time.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Locks older than this are considered abandoned.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Tuning for lock staleness and checkpoint throttling.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSettings {
    pub lock_timeout: Duration,
    pub progress_bytes: u64,
    pub progress_interval: Duration,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            progress_bytes: DEFAULT_PROGRESS_BYTES,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// Identify this process as `host:pid`.
pub fn default_instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}:{}", host, std::process::id())
}

/// Lifecycle, locking and checkpoint operations over a [`RecordStore`].
pub struct StateManager {
    store: Arc<dyn RecordStore>,
    instance_id: String,
    settings: StateSettings,
}

impl StateManager {
    pub fn new(store: Arc<dyn RecordStore>, settings: StateSettings) -> Self {
        Self::with_instance_id(store, settings, default_instance_id())
    }

    pub fn with_instance_id(
        store: Arc<dyn RecordStore>,
        settings: StateSettings,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
            settings,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn settings(&self) -> &StateSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    fn lock_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.settings.lock_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365))
    }

    /// Fetch a record or fail with [`Error::RecordNotFound`].
    pub async fn get(&self, id: i64) -> Result<DownloadRecord> {
        self.store
            .get(id)
            .await?
            .ok_or(Error::RecordNotFound(id))
    }

    /// Resolve the record a job reports to, creating it on first download.
    ///
    /// Returns `None` for untracked jobs.
    pub async fn ensure_record(&self, job: &DownloadJob) -> Result<Option<DownloadRecord>> {
        if let Some(id) = job.record_id {
            return self.get(id).await.map(Some);
        }
        if !job.track {
            return Ok(None);
        }

        let (record, created) = self
            .store
            .create_or_get(NewRecord {
                catalog_id: job.catalog_id,
                source_url: Some(job.url.clone()),
                destination_base: Some(job.destination_base.to_string_lossy().into_owned()),
            })
            .await?;
        if created {
            tracing::info!(record_id = record.id, url = %job.url, "Created download record");
        }
        Ok(Some(record))
    }

    /// Take the record's lock for this instance.
    ///
    /// Returns `false` when another owner holds a live lock; the caller
    /// should skip the download rather than wait.
    pub async fn acquire_lock(&self, id: i64) -> Result<bool> {
        if let Err(e) = self.cleanup_stale_locks().await {
            tracing::warn!(error = %e, "Stale lock sweep failed, continuing");
        }

        let now = Utc::now();
        let rows = self
            .store
            .try_lock(id, &self.instance_id, now, now - self.lock_timeout())
            .await?;

        if rows == 0 {
            tracing::info!(record_id = id, "Download is locked elsewhere, skipping");
            return Ok(false);
        }
        tracing::info!(record_id = id, owner = %self.instance_id, "Acquired download lock");
        Ok(true)
    }

    /// Release the lock if this instance still owns it.
    ///
    /// A lock that was reclaimed by someone else is left alone and is not
    /// an error.
    pub async fn release_lock(&self, id: i64) -> Result<()> {
        let rows = self.store.release_lock(id, &self.instance_id).await?;
        if rows == 0 {
            tracing::debug!(record_id = id, "Lock already released or reclaimed");
        } else {
            tracing::info!(record_id = id, owner = %self.instance_id, "Released download lock");
        }
        Ok(())
    }

    /// Clear every lock older than the timeout.
    pub async fn cleanup_stale_locks(&self) -> Result<u64> {
        let cleared = self
            .store
            .clear_stale_locks(Utc::now() - self.lock_timeout())
            .await?;
        if cleared > 0 {
            tracing::info!(count = cleared, "Reclaimed stale download locks");
        }
        Ok(cleared)
    }

    /// Move a record to `status`, applying that status' side effects.
    pub async fn update_state(
        &self,
        id: i64,
        status: DownloadStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let update =
            StatusUpdate::for_transition(status, error_message.map(str::to_string), Utc::now());
        let rows = self.store.update_status(id, &update).await?;
        if rows == 0 {
            return Err(Error::RecordNotFound(id));
        }
        match error_message {
            Some(msg) => tracing::info!(record_id = id, status = %status, error = msg, "Download state changed"),
            None => tracing::info!(record_id = id, status = %status, "Download state changed"),
        }
        Ok(())
    }

    /// Record the final file and enter `completed`.
    pub async fn mark_completed(&self, id: i64, path: &str, size: u64) -> Result<()> {
        let rows = self.store.complete(id, path, size, Utc::now()).await?;
        if rows == 0 {
            return Err(Error::RecordNotFound(id));
        }
        tracing::info!(record_id = id, path, size, "Download state changed to completed");
        Ok(())
    }

    /// Best-effort checkpoint. Failures are logged and swallowed.
    pub async fn update_progress(&self, id: i64, bytes_downloaded: u64, total_bytes: Option<u64>) {
        match self
            .store
            .update_progress(id, bytes_downloaded, total_bytes, Utc::now())
            .await
        {
            Ok(_) => tracing::debug!(
                record_id = id,
                bytes_downloaded,
                total_bytes,
                "Progress checkpoint saved"
            ),
            Err(e) => tracing::warn!(record_id = id, error = %e, "Failed to save progress checkpoint"),
        }
    }

    /// Whether enough has happened since the last checkpoint to write another.
    pub fn should_persist_progress(&self, bytes_since_last: u64, time_since_last: Duration) -> bool {
        bytes_since_last >= self.settings.progress_bytes
            || time_since_last >= self.settings.progress_interval
    }

    /// Records eligible for a resume sweep.
    ///
    /// `max_retries` of zero disables the retry filter.
    pub async fn get_incomplete_downloads(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<DownloadRecord>> {
        let query = IncompleteQuery {
            max_retries,
            stale_before: Some(Utc::now() - self.lock_timeout()),
            limit,
        };
        self.store.query_incomplete(&query).await
    }

    /// Every incomplete record, locked or not, in sweep order.
    pub async fn list_incomplete(&self, limit: usize) -> Result<Vec<DownloadRecord>> {
        let query = IncompleteQuery {
            max_retries: 0,
            stale_before: None,
            limit,
        };
        self.store.query_incomplete(&query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn store() -> Arc<dyn RecordStore> {
        Arc::new(SqliteStore::open_in_memory().unwrap())
    }

    fn manager(store: &Arc<dyn RecordStore>, id: &str, timeout: Duration) -> StateManager {
        StateManager::with_instance_id(
            Arc::clone(store),
            StateSettings {
                lock_timeout: timeout,
                ..StateSettings::default()
            },
            id,
        )
    }

    async fn seed(store: &Arc<dyn RecordStore>) -> i64 {
        static NEXT: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
        let n = NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        store
            .create(NewRecord {
                source_url: Some(format!("http://example.test/{}.mkv", n)),
                destination_base: Some("/tmp/a".into()),
                ..NewRecord::default()
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_lock_exclusivity_between_instances() {
        let store = store();
        let id = seed(&store).await;
        let a = Arc::new(manager(&store, "host-a:1", Duration::from_secs(60)));
        let b = Arc::new(manager(&store, "host-b:2", Duration::from_secs(60)));

        let (ra, rb) = tokio::join!(a.acquire_lock(id), b.acquire_lock(id));
        let wins = [ra.unwrap(), rb.unwrap()].iter().filter(|w| **w).count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimable() {
        let store = store();
        let id = seed(&store).await;
        let a = manager(&store, "host-a:1", Duration::from_millis(50));
        let b = manager(&store, "host-b:2", Duration::from_millis(50));

        assert!(a.acquire_lock(id).await.unwrap());
        assert!(!b.acquire_lock(id).await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(b.acquire_lock(id).await.unwrap());
        assert_eq!(
            store.get(id).await.unwrap().unwrap().locked_by.as_deref(),
            Some("host-b:2")
        );

        // The old owner cannot release a lock it lost.
        a.release_lock(id).await.unwrap();
        assert_eq!(
            store.get(id).await.unwrap().unwrap().locked_by.as_deref(),
            Some("host-b:2")
        );
    }

    #[tokio::test]
    async fn test_terminal_states_clear_lock() {
        let store = store();
        let a = manager(&store, "host-a:1", Duration::from_secs(60));

        for status in [DownloadStatus::Completed, DownloadStatus::Failed] {
            let id = seed(&store).await;
            assert!(a.acquire_lock(id).await.unwrap());
            a.update_state(id, DownloadStatus::Downloading, None).await.unwrap();
            let rec = store.get(id).await.unwrap().unwrap();
            assert!(rec.started_at.is_some());
            assert!(rec.locked_at.is_some());

            a.update_state(id, status, Some("done")).await.unwrap();
            let rec = store.get(id).await.unwrap().unwrap();
            assert_eq!(rec.status, status);
            assert!(rec.locked_at.is_none() && rec.locked_by.is_none());
            assert!(rec.completed_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_retrying_increments_count() {
        let store = store();
        let id = seed(&store).await;
        let a = manager(&store, "host-a:1", Duration::from_secs(60));

        a.update_state(id, DownloadStatus::Retrying, None).await.unwrap();
        let rec = a.get(id).await.unwrap();
        assert_eq!(rec.retry_count, 1);
        assert!(rec.last_retry_at.is_some());
    }

    #[tokio::test]
    async fn test_update_state_on_missing_record() {
        let a = manager(&store(), "host-a:1", Duration::from_secs(60));
        let err = a
            .update_state(999, DownloadStatus::Downloading, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RecordNotFound(999)));
    }

    #[test]
    fn test_progress_throttle() {
        let a = manager(&store(), "host-a:1", Duration::from_secs(60));
        assert!(!a.should_persist_progress(1024, Duration::from_secs(1)));
        assert!(a.should_persist_progress(DEFAULT_PROGRESS_BYTES, Duration::ZERO));
        assert!(a.should_persist_progress(0, Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_incomplete_skips_live_locks() {
        let store = store();
        let a = manager(&store, "host-a:1", Duration::from_secs(60));
        let free = seed(&store).await;
        let held = seed(&store).await;
        assert!(a.acquire_lock(held).await.unwrap());

        let ids: Vec<i64> = a
            .get_incomplete_downloads(5, 10)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![free]);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_record_shares_one_record() {
        let store = store();
        let a = manager(&store, "host-a:1", Duration::from_secs(60));
        let b = manager(&store, "host-b:2", Duration::from_secs(60));
        let job = DownloadJob::new("http://example.test/dup.mkv", "/tmp/dup").tracked(None);

        let (ra, rb) = tokio::join!(a.ensure_record(&job), b.ensure_record(&job));
        let (ra, rb) = (ra.unwrap().unwrap(), rb.unwrap().unwrap());
        assert_eq!(ra.id, rb.id);

        let again = a.ensure_record(&job).await.unwrap().unwrap();
        assert_eq!(again.id, ra.id);
    }

    #[test]
    fn test_instance_id_has_pid() {
        let id = default_instance_id();
        assert!(id.ends_with(&format!(":{}", std::process::id())));
    }
}
