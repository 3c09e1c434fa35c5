//! Fixed-size worker pool over a [`Downloader`].

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::download::downloader::Downloader;
use crate::download::job::{DownloadJob, DownloadResult};
use crate::error::{Error, Result};

/// Default number of concurrent workers.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default capacity of the pending job queue.
pub const DEFAULT_QUEUE_SIZE: usize = 64;

/// Result for one submitted job.
#[derive(Debug)]
pub struct JobOutcome {
    pub job_id: String,
    pub record_id: Option<i64>,
    pub result: Result<DownloadResult>,
}

impl JobOutcome {
    fn cancelled(job: &DownloadJob) -> Self {
        Self {
            job_id: job.id.clone(),
            record_id: job.record_id,
            result: Err(Error::Cancelled),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Fans jobs out across `concurrency` workers.
///
/// Outcomes arrive in completion order, one per submitted job, including
/// jobs that never started because the batch was cancelled.
pub struct ParallelDownloader {
    downloader: Arc<Downloader>,
    concurrency: usize,
    queue_size: usize,
}

impl ParallelDownloader {
    pub fn new(downloader: Arc<Downloader>, concurrency: usize) -> Self {
        Self {
            downloader,
            concurrency: concurrency.max(1),
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size.max(1);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Change the worker count for future batches. Zero is ignored.
    pub fn set_concurrency(&mut self, concurrency: usize) {
        if concurrency == 0 {
            tracing::warn!(
                current = self.concurrency,
                "Ignoring non-positive concurrency"
            );
            return;
        }
        self.concurrency = concurrency;
    }

    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    /// Start a batch and return the outcome stream.
    ///
    /// The stream closes after the last outcome. Cancelling `cancel` makes
    /// in-flight and queued jobs report [`Error::Cancelled`].
    pub fn spawn(
        &self,
        jobs: Vec<DownloadJob>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<JobOutcome> {
        let (result_tx, result_rx) = mpsc::channel(jobs.len().max(1));
        let (job_tx, job_rx) = mpsc::channel::<DownloadJob>(self.queue_size);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let workers = self.concurrency.min(jobs.len()).max(1);

        tracing::info!(jobs = jobs.len(), workers, "Starting download batch");

        {
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut pending = jobs.into_iter();
                while let Some(job) = pending.next() {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            for job in std::iter::once(job).chain(pending.by_ref()) {
                                let _ = result_tx.send(JobOutcome::cancelled(&job)).await;
                            }
                            break;
                        }
                        permit = job_tx.reserve() => match permit {
                            Ok(permit) => permit.send(job),
                            Err(_) => break,
                        },
                    }
                }
            });
        }

        for worker in 0..workers {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let downloader = Arc::clone(&self.downloader);
            let cancel = cancel.clone();

            tokio::spawn(async move {
                loop {
                    let next = job_rx.lock().await.recv().await;
                    let Some(job) = next else {
                        break;
                    };

                    let result = if cancel.is_cancelled() {
                        Err(Error::Cancelled)
                    } else {
                        tracing::debug!(worker, job = %job.id, "Worker picked up job");
                        downloader.download(&job, &cancel).await
                    };

                    if let Err(e) = &result {
                        tracing::debug!(worker, job = %job.id, error = %e, "Job failed");
                    }

                    let outcome = JobOutcome {
                        job_id: job.id,
                        record_id: job.record_id,
                        result,
                    };
                    if result_tx.send(outcome).await.is_err() {
                        break;
                    }
                }
            });
        }

        result_rx
    }

    /// Run a batch to completion and collect every outcome.
    pub async fn download_all(
        &self,
        jobs: Vec<DownloadJob>,
        cancel: CancellationToken,
    ) -> Vec<JobOutcome> {
        let expected = jobs.len();
        let mut rx = self.spawn(jobs, cancel);
        let mut outcomes = Vec::with_capacity(expected);
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }
        outcomes
    }
}
