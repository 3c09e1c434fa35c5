//! Atomic placement of finished downloads.
//!
//! A file only becomes visible at its destination through a rename or a
//! size-verified copy; a partial file is never left there.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::{Error, Result};

/// Permissions applied to placed files on Unix (rw-r--r--).
#[cfg(unix)]
const FILE_MODE: u32 = 0o644;

/// Move `src` to `dest`, creating parent directories as needed.
///
/// Tries a rename first and falls back to copy, verify, delete when the
/// rename fails (for example across filesystems). Returns the placed size.
pub async fn place_file(src: &Path, dest: &Path) -> Result<u64> {
    let expected = fs::metadata(src).await?.len();

    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    match fs::rename(src, dest).await {
        Ok(()) => {}
        Err(e) => {
            tracing::debug!(
                src = %src.display(),
                dest = %dest.display(),
                error = %e,
                "Rename failed, falling back to copy"
            );
            copy_verified(src, dest, expected).await?;
            if let Err(e) = fs::remove_file(src).await {
                tracing::warn!(path = %src.display(), error = %e, "Could not remove staged file");
            }
        }
    }

    normalize_permissions(dest).await?;
    Ok(expected)
}

async fn copy_verified(src: &Path, dest: &Path, expected: u64) -> Result<()> {
    let staging = sibling_staging_path(dest);
    let copied = fs::copy(src, &staging).await;

    let verified = match copied {
        Ok(n) if n == expected => fs::metadata(&staging).await.map(|m| m.len() == expected),
        Ok(_) => Ok(false),
        Err(e) => Err(e),
    };

    match verified {
        Ok(true) => {
            fs::rename(&staging, dest).await?;
            Ok(())
        }
        Ok(false) => {
            let _ = fs::remove_file(&staging).await;
            Err(Error::Placement(format!(
                "copy of {} to {} did not match expected size {}",
                src.display(),
                dest.display(),
                expected
            )))
        }
        Err(e) => {
            let _ = fs::remove_file(&staging).await;
            Err(e.into())
        }
    }
}

/// Hidden staging name next to `dest`, so the final step is a same-directory rename.
fn sibling_staging_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.{}.partial", name, uuid::Uuid::new_v4().simple()))
}

#[cfg(unix)]
async fn normalize_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(FILE_MODE)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn normalize_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
