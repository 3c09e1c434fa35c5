//! Download requests and results.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

/// Snapshot handed to progress callbacks on every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

/// Called synchronously on the fetching worker; keep it cheap.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// One transfer request.
#[derive(Clone)]
pub struct DownloadJob {
    /// Caller-chosen request identifier, echoed back in results.
    pub id: String,
    pub url: String,
    /// Final path without extension; the extension is resolved after fetch.
    pub destination_base: PathBuf,
    /// Overrides the downloader's temp root for this job.
    pub temp_dir: Option<PathBuf>,
    /// Existing record to report to.
    pub record_id: Option<i64>,
    /// Create (or reuse) a record keyed by URL and destination.
    pub track: bool,
    /// Catalog back-reference stored on newly created records.
    pub catalog_id: Option<i64>,
    pub progress: Option<ProgressCallback>,
}

impl fmt::Debug for DownloadJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadJob")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("destination_base", &self.destination_base)
            .field("temp_dir", &self.temp_dir)
            .field("record_id", &self.record_id)
            .field("track", &self.track)
            .field("catalog_id", &self.catalog_id)
            .finish_non_exhaustive()
    }
}

impl DownloadJob {
    pub fn new(url: impl Into<String>, destination_base: impl Into<PathBuf>) -> Self {
        let url = url.into();
        Self {
            id: url.clone(),
            url,
            destination_base: destination_base.into(),
            temp_dir: None,
            record_id: None,
            track: false,
            catalog_id: None,
            progress: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_record(mut self, record_id: i64) -> Self {
        self.record_id = Some(record_id);
        self
    }

    /// Track this job in the record store, creating a record if needed.
    pub fn tracked(mut self, catalog_id: Option<i64>) -> Self {
        self.track = true;
        self.catalog_id = catalog_id;
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    /// Whether this job reports to the record store.
    pub fn is_tracked(&self) -> bool {
        self.record_id.is_some() || self.track
    }

    /// Reject jobs that could never succeed.
    pub fn validate(&self) -> Result<()> {
        let parsed = url::Url::parse(&self.url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidRequest(format!(
                "Unsupported URL scheme '{}': {}",
                parsed.scheme(),
                self.url
            )));
        }

        let name = self
            .destination_base
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.trim().is_empty() || name == ".." {
            return Err(Error::InvalidRequest(format!(
                "Destination has no file name: {}",
                self.destination_base.display()
            )));
        }
        Ok(())
    }

    pub(crate) fn report(&self, progress: Progress) {
        if let Some(callback) = &self.progress {
            callback(progress);
        }
    }
}

/// Outcome of a successful download.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadResult {
    pub file_path: PathBuf,
    /// Resolved extension, without the leading dot.
    pub extension: String,
    pub file_size: u64,
    /// Fetch attempts made, including the successful one.
    pub attempts: u32,
    pub duration: Duration,
    /// Time spent placing the file at its destination.
    pub move_duration: Duration,
}

/// Append `.ext` to a path without replacing anything after a dot in the
/// base name.
pub fn with_extension_appended(base: &Path, extension: &str) -> PathBuf {
    let mut raw = base.as_os_str().to_owned();
    raw.push(".");
    raw.push(extension);
    PathBuf::from(raw)
}
