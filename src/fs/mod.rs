//! Filesystem module.
//!
//! Provides:
//! - Disk space pre-flight checks
//! - Per-transfer temp workspaces and orphan cleanup
//! - Atomic placement of finished files

pub mod cleanup;
pub mod placement;
pub mod space;
pub mod temp;

pub use cleanup::{cleanup_orphaned_temp, CleanupReport, TEMP_DIR_PREFIX};
pub use placement::place_file;
pub use space::{available_space, check_disk_space, format_bytes};
pub use temp::TempWorkspace;
