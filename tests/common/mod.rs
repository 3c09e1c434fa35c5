//! Shared fixtures: an in-process HTTP server and engine wiring.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::header::{AUTHORIZATION, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mediafetch::download::{StateSettings, StateManager};
use mediafetch::store::{
    DownloadRecord, IncompleteQuery, NewRecord, RecordStore, SqliteStore, StatusUpdate,
};
use mediafetch::{Downloader, Error, RetryPolicy};

/// What the server saw.
#[derive(Debug, Default)]
pub struct Recorder {
    hits: AtomicU32,
    ranges: Mutex<Vec<Option<String>>>,
    auth: Mutex<Vec<Option<String>>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count a request and return its 1-based sequence number.
    pub fn hit(&self, headers: &HeaderMap) -> u32 {
        let header = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        self.ranges.lock().unwrap().push(header(RANGE));
        self.auth.lock().unwrap().push(header(AUTHORIZATION));
        self.hits.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn ranges(&self) -> Vec<Option<String>> {
        self.ranges.lock().unwrap().clone()
    }

    pub fn auth(&self) -> Vec<Option<String>> {
        self.auth.lock().unwrap().clone()
    }
}

/// Bind `app` to an ephemeral port and return its base URL.
pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Offset from a `Range: bytes=N-` header.
pub fn requested_offset(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(RANGE)?
        .to_str()
        .ok()?
        .strip_prefix("bytes=")?
        .strip_suffix('-')?
        .parse()
        .ok()
}

/// Serve `body`, honouring `Range` requests.
pub fn ranged(body: &[u8], content_type: &str, headers: &HeaderMap) -> Response {
    let total = body.len();
    if let Some(start) = requested_offset(headers).filter(|&s| s < total) {
        return (
            StatusCode::PARTIAL_CONTENT,
            [
                (CONTENT_TYPE, content_type.to_string()),
                (CONTENT_RANGE, format!("bytes {}-{}/{}", start, total - 1, total)),
            ],
            body[start..].to_vec(),
        )
            .into_response();
    }
    full(body, content_type)
}

/// Serve all of `body` with a 200, ignoring any `Range`.
pub fn full(body: &[u8], content_type: &str) -> Response {
    ([(CONTENT_TYPE, content_type.to_string())], body.to_vec()).into_response()
}

/// Fast retries for tests.
pub fn quick_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        multiplier: 2.0,
        jitter: 0.0,
    }
}

pub fn memory_store() -> Arc<dyn RecordStore> {
    Arc::new(SqliteStore::open_in_memory().unwrap())
}

pub fn state(store: &Arc<dyn RecordStore>, instance: &str) -> Arc<StateManager> {
    Arc::new(StateManager::with_instance_id(
        Arc::clone(store),
        StateSettings::default(),
        instance,
    ))
}

pub fn downloader(temp_root: &std::path::Path, retry: RetryPolicy) -> Downloader {
    Downloader::new(reqwest::Client::new())
        .with_retry(retry)
        .with_temp_root(temp_root)
}

/// Names of per-transfer temp directories still under `root`.
pub fn leftover_workspaces(root: &std::path::Path) -> Vec<String> {
    std::fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.starts_with(mediafetch::fs::TEMP_DIR_PREFIX))
                .collect()
        })
        .unwrap_or_default()
}

/// Store wrapper that logs checkpoint writes and can fail the best-effort
/// operations on demand.
pub struct ObservedStore {
    inner: Arc<dyn RecordStore>,
    fail_progress: bool,
    fail_sweep: bool,
    progress: Mutex<Vec<(u64, Option<u64>)>>,
    sweeps: AtomicU32,
}

impl ObservedStore {
    pub fn new(inner: Arc<dyn RecordStore>) -> Arc<Self> {
        Self::failing(inner, false, false)
    }

    pub fn failing(inner: Arc<dyn RecordStore>, progress: bool, sweep: bool) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_progress: progress,
            fail_sweep: sweep,
            progress: Mutex::new(Vec::new()),
            sweeps: AtomicU32::new(0),
        })
    }

    /// Every `update_progress` call, including failed ones.
    pub fn progress_writes(&self) -> Vec<(u64, Option<u64>)> {
        self.progress.lock().unwrap().clone()
    }

    pub fn sweeps(&self) -> u32 {
        self.sweeps.load(Ordering::SeqCst)
    }

    fn unavailable() -> Error {
        Error::Database(rusqlite::Error::InvalidQuery)
    }
}

#[async_trait]
impl RecordStore for ObservedStore {
    async fn create(&self, new: NewRecord) -> mediafetch::Result<DownloadRecord> {
        self.inner.create(new).await
    }

    async fn create_or_get(&self, new: NewRecord) -> mediafetch::Result<(DownloadRecord, bool)> {
        self.inner.create_or_get(new).await
    }

    async fn get(&self, id: i64) -> mediafetch::Result<Option<DownloadRecord>> {
        self.inner.get(id).await
    }

    async fn find_by_source(
        &self,
        source_url: &str,
        destination_base: &str,
    ) -> mediafetch::Result<Option<DownloadRecord>> {
        self.inner.find_by_source(source_url, destination_base).await
    }

    async fn try_lock(
        &self,
        id: i64,
        owner: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> mediafetch::Result<u64> {
        self.inner.try_lock(id, owner, now, stale_before).await
    }

    async fn release_lock(&self, id: i64, owner: &str) -> mediafetch::Result<u64> {
        self.inner.release_lock(id, owner).await
    }

    async fn clear_stale_locks(&self, stale_before: DateTime<Utc>) -> mediafetch::Result<u64> {
        self.sweeps.fetch_add(1, Ordering::SeqCst);
        if self.fail_sweep {
            return Err(Self::unavailable());
        }
        self.inner.clear_stale_locks(stale_before).await
    }

    async fn update_status(&self, id: i64, update: &StatusUpdate) -> mediafetch::Result<u64> {
        self.inner.update_status(id, update).await
    }

    async fn update_progress(
        &self,
        id: i64,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
        at: DateTime<Utc>,
    ) -> mediafetch::Result<u64> {
        self.progress
            .lock()
            .unwrap()
            .push((bytes_downloaded, total_bytes));
        if self.fail_progress {
            return Err(Self::unavailable());
        }
        self.inner
            .update_progress(id, bytes_downloaded, total_bytes, at)
            .await
    }

    async fn complete(
        &self,
        id: i64,
        download_path: &str,
        file_size: u64,
        at: DateTime<Utc>,
    ) -> mediafetch::Result<u64> {
        self.inner.complete(id, download_path, file_size, at).await
    }

    async fn query_incomplete(
        &self,
        query: &IncompleteQuery,
    ) -> mediafetch::Result<Vec<DownloadRecord>> {
        self.inner.query_incomplete(query).await
    }
}

/// State manager with custom checkpoint throttling.
pub fn state_with(
    store: &Arc<dyn RecordStore>,
    instance: &str,
    progress_bytes: u64,
    progress_interval: Duration,
) -> Arc<StateManager> {
    Arc::new(StateManager::with_instance_id(
        Arc::clone(store),
        StateSettings {
            progress_bytes,
            progress_interval,
            ..StateSettings::default()
        },
        instance,
    ))
}

