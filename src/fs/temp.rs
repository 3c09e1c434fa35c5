//! Per-transfer temp workspaces.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::fs::cleanup::TEMP_DIR_PREFIX;

/// Uniquely named directory that holds one transfer's staged bytes.
///
/// Call [`TempWorkspace::close`] when done. A workspace dropped without
/// closing (its future was abandoned) is removed synchronously in `Drop`.
#[derive(Debug)]
pub struct TempWorkspace {
    dir: PathBuf,
    closed: bool,
}

impl TempWorkspace {
    /// Create `<root>/mediafetch-<uuid>`.
    pub async fn create(root: &Path) -> Result<Self> {
        let dir = root.join(format!("{}{}", TEMP_DIR_PREFIX, uuid::Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&dir).await?;
        tracing::debug!(path = %dir.display(), "Created temp workspace");
        Ok(Self { dir, closed: false })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Where the payload is staged while it downloads.
    pub fn staging_file(&self) -> PathBuf {
        self.dir.join("payload.part")
    }

    /// Remove the workspace off the async worker threads.
    pub async fn close(mut self) {
        self.closed = true;
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            log_removal_error(&self.dir, &e);
        }
    }
}

fn log_removal_error(dir: &Path, e: &std::io::Error) {
    if e.kind() != std::io::ErrorKind::NotFound {
        tracing::warn!(path = %dir.display(), error = %e, "Failed to remove temp workspace");
    }
}

impl Drop for TempWorkspace {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            log_removal_error(&self.dir, &e);
        }
    }
}
