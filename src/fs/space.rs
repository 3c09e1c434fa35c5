//! Disk space pre-flight checks.

use std::path::Path;

use crate::error::{Error, Result};

/// Free bytes on the filesystem holding `path`, or `None` if unknown.
pub fn available_space(path: &Path) -> Option<u64> {
    let probe = existing_ancestor(path)?;
    match fs2::available_space(probe) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!(path = %probe.display(), error = %e, "Could not query free space");
            None
        }
    }
}

/// Fail with [`Error::InsufficientSpace`] if `dir` cannot take `required`
/// more bytes while keeping `reserve` bytes free.
///
/// An unknown free-space figure passes; the write itself will fail if
/// the disk really is full.
pub fn check_disk_space(dir: &Path, required: u64, reserve: u64) -> Result<()> {
    let Some(available) = available_space(dir) else {
        return Ok(());
    };
    let needed = required.saturating_add(reserve);
    if available < needed {
        return Err(Error::InsufficientSpace {
            required: needed,
            available,
        });
    }
    Ok(())
}

/// Format bytes as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

fn existing_ancestor(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| !p.as_os_str().is_empty() && p.exists())
}
