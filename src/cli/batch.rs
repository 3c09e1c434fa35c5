//! Batch file parsing.
//!
//! One job per line: `URL<TAB>DEST_BASE`. Blank lines and lines starting
//! with `#` are skipped.

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::download::DownloadJob;
use crate::error::{Error, Result};

/// One parsed batch line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub line: usize,
    pub url: String,
    pub destination_base: PathBuf,
}

/// Parse batch file content. Fails on the first malformed line.
pub fn parse_batch(content: &str) -> Result<Vec<BatchEntry>> {
    let mut entries = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        let (url, dest) = line.split_once('\t').ok_or_else(|| {
            Error::InvalidRequest(format!("line {}: expected URL<TAB>DEST_BASE", idx + 1))
        })?;
        let (url, dest) = (url.trim(), dest.trim());
        if url.is_empty() || dest.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "line {}: empty URL or destination",
                idx + 1
            )));
        }
        entries.push(BatchEntry {
            line: idx + 1,
            url: url.to_string(),
            destination_base: PathBuf::from(dest),
        });
    }
    Ok(entries)
}

/// Read `path` and build tracked jobs, resolving relative destinations
/// against the configured output directory.
pub fn load_batch_jobs(path: &Path, config: &Config) -> Result<Vec<DownloadJob>> {
    let content = std::fs::read_to_string(path)?;
    let jobs = parse_batch(&content)?
        .into_iter()
        .map(|entry| {
            DownloadJob::new(entry.url, config.resolve_destination(&entry.destination_base))
                .with_id(format!("line {}", entry.line))
                .tracked(None)
        })
        .collect();
    Ok(jobs)
}
