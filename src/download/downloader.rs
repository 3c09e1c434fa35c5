//! Single-transfer orchestration.
//!
//! A tracked download runs: lock, `downloading`, streamed fetch into a
//! temp workspace (retried, optionally resumed), extension resolution,
//! atomic placement, `completed`, unlock. Any failure ends in `failed`
//! (or `paused` on cancellation) and the lock is always released.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{redirect, Client};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::download::extension;
use crate::download::job::{with_extension_appended, DownloadJob, DownloadResult, Progress};
use crate::download::resume::{self, PartialState, ResumeResponse};
use crate::download::state::StateManager;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::{check_disk_space, place_file, TempWorkspace};
use crate::resilience::{CallOutcome, CircuitBreaker, RetryPolicy};
use crate::store::DownloadStatus;

/// Upper bound on redirects followed before a request fails.
pub const MAX_REDIRECTS: usize = 10;

/// HTTP client settings.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Overall per-request timeout, including the body.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    pub max_redirects: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
            user_agent: format!("mediafetch/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: MAX_REDIRECTS,
        }
    }
}

/// Build the shared HTTP client.
pub fn build_http_client(settings: &HttpSettings) -> Result<Client> {
    Client::builder()
        .user_agent(&settings.user_agent)
        .timeout(settings.timeout)
        .connect_timeout(settings.connect_timeout)
        .redirect(redirect::Policy::limited(
            settings.max_redirects.min(MAX_REDIRECTS),
        ))
        .build()
        .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))
}

/// HTTP Basic credentials sent with every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

/// What one fetch produced in the staging file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub bytes: u64,
    pub total: Option<u64>,
    pub content_type: Option<String>,
    pub attempts: u32,
}

#[derive(Clone, Copy)]
struct Tracking<'a> {
    state: &'a StateManager,
    record_id: i64,
}

#[derive(Debug, Default)]
struct TransferMeta {
    total: Option<u64>,
    content_type: Option<String>,
    downloaded: u64,
}

#[derive(Debug)]
struct Placed {
    fetched: FetchOutcome,
    extension: String,
    destination: PathBuf,
    file_size: u64,
    move_duration: Duration,
}

#[derive(Debug)]
struct Checkpoint {
    bytes: u64,
    at: Instant,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Only the remote side's failures count against the breaker; cancellation
/// and local errors leave it as it was.
fn breaker_outcome<T>(result: &Result<T>) -> CallOutcome {
    match result {
        Ok(_) => CallOutcome::Success,
        Err(e) if e.kind() == ErrorKind::ExternalService => CallOutcome::Failure,
        Err(_) => CallOutcome::Ignored,
    }
}

/// Downloads one job at a time; share it behind an `Arc` for concurrency.
pub struct Downloader {
    client: Client,
    state: Option<Arc<StateManager>>,
    retry: RetryPolicy,
    breaker: Option<Arc<CircuitBreaker>>,
    credentials: Option<Credentials>,
    temp_root: PathBuf,
    min_free_bytes: u64,
}

impl Downloader {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            state: None,
            retry: RetryPolicy::default(),
            breaker: None,
            credentials: None,
            temp_root: std::env::temp_dir(),
            min_free_bytes: 0,
        }
    }

    pub fn with_state(mut self, state: Arc<StateManager>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Route every fetch attempt through `breaker`.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = root.into();
        self
    }

    /// Keep at least this many bytes free when staging.
    pub fn with_min_free_bytes(mut self, bytes: u64) -> Self {
        self.min_free_bytes = bytes;
        self
    }

    pub fn state(&self) -> Option<&Arc<StateManager>> {
        self.state.as_ref()
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    /// Run one job end to end.
    ///
    /// A tracked job whose record is locked elsewhere fails with
    /// [`Error::LockHeld`]; callers should skip it, not retry at once.
    pub async fn download(
        &self,
        job: &DownloadJob,
        cancel: &CancellationToken,
    ) -> Result<DownloadResult> {
        job.validate()?;
        let started = Instant::now();

        if !job.is_tracked() {
            return self.transfer(job, None, cancel, started).await;
        }
        let state = self.state.as_deref().ok_or_else(|| {
            Error::InvalidRequest(format!(
                "job {} is tracked but no record store is configured",
                job.id
            ))
        })?;

        let Some(record) = state.ensure_record(job).await? else {
            return self.transfer(job, None, cancel, started).await;
        };
        if !state.acquire_lock(record.id).await? {
            return Err(Error::LockHeld(record.id));
        }

        let tracking = Tracking {
            state,
            record_id: record.id,
        };
        let outcome = self
            .run_tracked(job, tracking, record.status, cancel, started)
            .await;

        if let Err(e) = state.release_lock(record.id).await {
            tracing::warn!(record_id = record.id, error = %e, "Failed to release download lock");
        }
        outcome
    }

    async fn run_tracked(
        &self,
        job: &DownloadJob,
        tracking: Tracking<'_>,
        previous: DownloadStatus,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<DownloadResult> {
        let Tracking { state, record_id } = tracking;

        if previous == DownloadStatus::Failed {
            state
                .update_state(record_id, DownloadStatus::Retrying, None)
                .await?;
        }
        state
            .update_state(record_id, DownloadStatus::Downloading, None)
            .await?;

        match self.transfer(job, Some(tracking), cancel, started).await {
            Ok(result) => {
                state
                    .mark_completed(
                        record_id,
                        &result.file_path.to_string_lossy(),
                        result.file_size,
                    )
                    .await?;
                Ok(result)
            }
            Err(Error::Cancelled) => {
                if let Err(e) = state
                    .update_state(record_id, DownloadStatus::Paused, None)
                    .await
                {
                    tracing::warn!(record_id, error = %e, "Failed to mark download paused");
                }
                Err(Error::Cancelled)
            }
            Err(err) => {
                let message = err.to_string();
                if let Err(e) = state
                    .update_state(record_id, DownloadStatus::Failed, Some(&message))
                    .await
                {
                    tracing::warn!(record_id, error = %e, "Failed to mark download failed");
                }
                Err(err)
            }
        }
    }

    async fn transfer(
        &self,
        job: &DownloadJob,
        tracking: Option<Tracking<'_>>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<DownloadResult> {
        let temp_root = job.temp_dir.as_deref().unwrap_or(&self.temp_root);
        let workspace = TempWorkspace::create(temp_root).await?;
        let staged = self.fetch_and_place(job, &workspace, tracking, cancel).await;
        workspace.close().await;
        let Placed {
            fetched,
            extension,
            destination,
            file_size,
            move_duration,
        } = staged?;

        tracing::info!(
            job = %job.id,
            path = %destination.display(),
            bytes = file_size,
            attempts = fetched.attempts,
            "Download complete"
        );

        Ok(DownloadResult {
            file_path: destination,
            extension,
            file_size,
            attempts: fetched.attempts,
            duration: started.elapsed(),
            move_duration,
        })
    }

    async fn fetch_and_place(
        &self,
        job: &DownloadJob,
        workspace: &TempWorkspace,
        tracking: Option<Tracking<'_>>,
        cancel: &CancellationToken,
    ) -> Result<Placed> {
        let staging = workspace.staging_file();
        let fetched = self
            .fetch_with_retry(job, &staging, None, tracking, cancel)
            .await?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let extension = extension::resolve(&job.url, fetched.content_type.as_deref());
        let destination = with_extension_appended(&job.destination_base, &extension);

        let move_started = Instant::now();
        let file_size = place_file(&staging, &destination).await?;
        Ok(Placed {
            fetched,
            extension,
            destination,
            file_size,
            move_duration: move_started.elapsed(),
        })
    }

    /// Fetch `job.url` into `staging`, continuing from whatever is already
    /// there when `expected_total` says it is a usable prefix.
    ///
    /// No request is made when the staged file already holds
    /// `expected_total` bytes. Retries per the configured policy.
    pub async fn fetch_into(
        &self,
        job: &DownloadJob,
        staging: &Path,
        expected_total: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        self.fetch_with_retry(job, staging, expected_total, None, cancel)
            .await
    }

    async fn fetch_with_retry(
        &self,
        job: &DownloadJob,
        staging: &Path,
        expected_total: Option<u64>,
        tracking: Option<Tracking<'_>>,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let meta = Mutex::new(TransferMeta {
            total: expected_total,
            ..TransferMeta::default()
        });
        let checkpoint = Mutex::new(Checkpoint {
            bytes: 0,
            at: Instant::now(),
        });
        let attempts = AtomicU32::new(0);

        let (meta_ref, checkpoint_ref, attempts_ref) = (&meta, &checkpoint, &attempts);
        let result = self
            .retry
            .run(cancel, Error::is_retryable, move |attempt| async move {
                attempts_ref.store(attempt, Ordering::Relaxed);
                if attempt > 1 {
                    if let Some(t) = tracking {
                        if let Err(e) = t
                            .state
                            .update_state(t.record_id, DownloadStatus::Retrying, None)
                            .await
                        {
                            tracing::warn!(record_id = t.record_id, error = %e, "Failed to mark retry");
                        }
                    }
                }
                self.guarded_attempt(job, staging, meta_ref, checkpoint_ref, tracking, cancel)
                    .await
            })
            .await;

        let meta = meta.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(t) = tracking {
            if result.is_err() && meta.downloaded > 0 {
                t.state
                    .update_progress(t.record_id, meta.downloaded, meta.total)
                    .await;
            }
        }

        let bytes = result?;
        Ok(FetchOutcome {
            bytes,
            total: meta.total,
            content_type: meta.content_type,
            attempts: attempts.into_inner(),
        })
    }

    async fn guarded_attempt(
        &self,
        job: &DownloadJob,
        staging: &Path,
        meta: &Mutex<TransferMeta>,
        checkpoint: &Mutex<Checkpoint>,
        tracking: Option<Tracking<'_>>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let attempt = self.fetch_attempt(job, staging, meta, checkpoint, tracking, cancel);
        match &self.breaker {
            Some(breaker) => breaker.call_with(|| attempt, breaker_outcome).await,
            None => attempt.await,
        }
    }

    async fn fetch_attempt(
        &self,
        job: &DownloadJob,
        staging: &Path,
        meta: &Mutex<TransferMeta>,
        checkpoint: &Mutex<Checkpoint>,
        tracking: Option<Tracking<'_>>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let known_total = guard(meta).total;
        let offset = match resume::inspect_partial(staging, known_total).await? {
            PartialState::Complete(size) => {
                tracing::debug!(job = %job.id, size, "Staged file already complete");
                guard(meta).downloaded = size;
                return Ok(size);
            }
            PartialState::Resume(size) => size,
            PartialState::Fresh | PartialState::Corrupt(_) => 0,
        };

        let mut request = resume::build_range_request(&self.client, &job.url, offset);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, creds.password.as_ref());
        }

        tracing::debug!(job = %job.id, url = %job.url, offset, "GET");
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = request.send() => response?,
        };

        let disposition = resume::check_resume_response(&response, offset)?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let (mut downloaded, total, append) = match disposition {
            ResumeResponse::Partial(range) => (offset, range.total.or(known_total), true),
            ResumeResponse::Restart { total } => (0, total, false),
        };
        {
            let mut meta = guard(meta);
            meta.total = total;
            meta.downloaded = downloaded;
            if content_type.is_some() {
                meta.content_type = content_type;
            }
        }

        if let (Some(total), Some(dir)) = (total, staging.parent()) {
            check_disk_space(dir, total.saturating_sub(downloaded), self.min_free_bytes)?;
        }

        let mut file = if append {
            tracing::info!(job = %job.id, offset, "Resuming transfer");
            OpenOptions::new().append(true).create(true).open(staging).await?
        } else {
            File::create(staging).await?
        };

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| Error::Stream(e.to_string()))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            guard(meta).downloaded = downloaded;

            job.report(Progress { downloaded, total });

            if let Some(t) = tracking {
                let due = {
                    let cp = guard(checkpoint);
                    t.state.should_persist_progress(
                        downloaded.saturating_sub(cp.bytes),
                        cp.at.elapsed(),
                    )
                };
                if due {
                    t.state.update_progress(t.record_id, downloaded, total).await;
                    *guard(checkpoint) = Checkpoint {
                        bytes: downloaded,
                        at: Instant::now(),
                    };
                }
            }
        }
        file.flush().await?;

        if let Some(total) = total {
            if downloaded != total {
                return Err(Error::Stream(format!(
                    "body ended at {} of {} bytes",
                    downloaded, total
                )));
            }
        }
        Ok(downloaded)
    }
}
