//! Download engine.
//!
//! - [`Downloader`]: one job end to end (lock, fetch, place, record)
//! - [`ParallelDownloader`]: bounded worker pool over a downloader
//! - [`StateManager`]: record state machine and advisory locks
//! - [`resume`]: HTTP range resume
//! - [`extension`]: output extension resolution

pub mod downloader;
pub mod extension;
pub mod job;
pub mod parallel;
pub mod resume;
pub mod state;

pub use downloader::{
    build_http_client, Credentials, Downloader, FetchOutcome, HttpSettings, MAX_REDIRECTS,
};
pub use job::{
    with_extension_appended, DownloadJob, DownloadResult, Progress, ProgressCallback,
};
pub use parallel::{JobOutcome, ParallelDownloader, DEFAULT_CONCURRENCY, DEFAULT_QUEUE_SIZE};
pub use state::{default_instance_id, StateManager, StateSettings};
