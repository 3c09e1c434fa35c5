//! mediafetch - resumable, lock-coordinated media downloads.
//!
//! This library provides the download engine behind the `mediafetch` CLI.
//!
//! # Features
//!
//! - Streamed HTTP downloads into per-transfer temp directories
//! - Range resume across retry attempts
//! - Exponential backoff with jitter and a circuit breaker
//! - Durable records with advisory locks shared across processes
//! - Bounded worker pool for batches
//! - Atomic placement at the final destination
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mediafetch::{
//!     Config, DownloadJob, Downloader, RecordStore, SqliteStore, StateManager,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(config.database_path()?)?);
//!     let state = Arc::new(StateManager::new(store, config.state_settings()));
//!     let downloader = Downloader::new(config.http_client()?)
//!         .with_state(state)
//!         .with_retry(config.retry_policy());
//!
//!     let job = DownloadJob::new("https://example.com/movie.mkv", "/media/movie").tracked(None);
//!     let result = downloader.download(&job, &CancellationToken::new()).await?;
//!     println!("saved {}", result.file_path.display());
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod download;
pub mod error;
pub mod fs;
pub mod output;
pub mod resilience;
pub mod store;

// Re-exports for convenience
pub use config::{validate_config, Config};
pub use download::{
    DownloadJob, DownloadResult, Downloader, JobOutcome, ParallelDownloader, Progress,
    StateManager,
};
pub use error::{Error, ErrorKind, Result};
pub use resilience::{CircuitBreaker, RetryPolicy};
pub use store::{DownloadRecord, DownloadStatus, RecordStore, SqliteStore};
