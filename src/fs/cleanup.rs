//! Garbage collection of orphaned temp directories.
//!
//! Every transfer stages into `<temp root>/mediafetch-<uuid>`. A crash
//! leaves that directory behind; this sweep removes old ones.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;

use crate::error::Result;

/// Prefix of every per-transfer temp directory.
pub const TEMP_DIR_PREFIX: &str = "mediafetch-";

/// Outcome of an orphan sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub bytes_freed: u64,
    pub errors: usize,
}

/// Remove `mediafetch-*` directories under `root` untouched for `max_age`.
pub async fn cleanup_orphaned_temp(root: &Path, max_age: Duration) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();

    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(e.into()),
    };

    let now = SystemTime::now();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(TEMP_DIR_PREFIX) {
            continue;
        }
        let meta = match entry.metadata().await {
            Ok(meta) if meta.is_dir() => meta,
            _ => continue,
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        let path = entry.path();
        let size = dir_size(&path).await;
        match fs::remove_dir_all(&path).await {
            Ok(()) => {
                tracing::info!(path = %path.display(), bytes = size, "Removed orphaned temp directory");
                report.bytes_freed += size;
                report.removed.push(path);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove orphaned temp directory");
                report.errors += 1;
            }
        }
    }

    Ok(report)
}

/// Total size of regular files directly and transitively under `dir`.
async fn dir_size(dir: &Path) -> u64 {
    let mut total = 0;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(mut entries) = fs::read_dir(&current).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            match entry.metadata().await {
                Ok(meta) if meta.is_dir() => pending.push(entry.path()),
                Ok(meta) => total += meta.len(),
                Err(_) => {}
            }
        }
    }
    total
}
