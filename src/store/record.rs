//! Download record model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a tracked transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    #[default]
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Retrying,
}

impl DownloadStatus {
    /// Statuses eligible for a resume sweep.
    pub const INCOMPLETE: [DownloadStatus; 5] = [
        DownloadStatus::Pending,
        DownloadStatus::Downloading,
        DownloadStatus::Paused,
        DownloadStatus::Failed,
        DownloadStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Retrying => "retrying",
        }
    }

    /// Terminal states release the lock when entered.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Failed)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(DownloadStatus::Pending),
            "downloading" => Ok(DownloadStatus::Downloading),
            "paused" => Ok(DownloadStatus::Paused),
            "completed" => Ok(DownloadStatus::Completed),
            "failed" => Ok(DownloadStatus::Failed),
            "retrying" => Ok(DownloadStatus::Retrying),
            _ => Err(format!("Unknown download status: {}", s)),
        }
    }
}

/// Durable state of one tracked transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: i64,
    /// Back-reference to the catalog entry that requested this download.
    pub catalog_id: Option<i64>,
    pub source_url: Option<String>,
    /// Destination path without extension.
    pub destination_base: Option<String>,
    pub status: DownloadStatus,
    pub download_path: Option<String>,
    pub file_size: Option<u64>,
    pub bytes_downloaded: Option<u64>,
    pub total_bytes: Option<u64>,
    /// Reserved for server-side resume validation; stored, never consulted.
    pub resume_token: Option<String>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadRecord {
    /// True when both progress fields are set and the transfer stopped short.
    pub fn is_partially_downloaded(&self) -> bool {
        matches!(
            (self.bytes_downloaded, self.total_bytes),
            (Some(done), Some(total)) if done < total
        )
    }

    /// True when a lock is set and younger than `lock_timeout`.
    pub fn is_locked(&self, now: DateTime<Utc>, lock_timeout: chrono::Duration) -> bool {
        match self.locked_at {
            Some(at) => now - at < lock_timeout,
            None => false,
        }
    }
}

/// Fields supplied when a record is first created.
#[derive(Debug, Clone, Default)]
pub struct NewRecord {
    pub catalog_id: Option<i64>,
    pub source_url: Option<String>,
    pub destination_base: Option<String>,
}

/// Column changes applied by one status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: DownloadStatus,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retried_at: Option<DateTime<Utc>>,
    pub clear_lock: bool,
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    /// Build the side effects of entering `status` at `now`.
    pub fn for_transition(
        status: DownloadStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status,
            error_message,
            started_at: (status == DownloadStatus::Downloading).then_some(now),
            completed_at: status.is_terminal().then_some(now),
            retried_at: (status == DownloadStatus::Retrying).then_some(now),
            clear_lock: status.is_terminal(),
            at: now,
        }
    }
}

/// Filter for the resume sweep query.
#[derive(Debug, Clone)]
pub struct IncompleteQuery {
    /// Only records with `retry_count` below this; ignored when zero.
    pub max_retries: u32,
    /// Locks taken before this instant count as stale. `None` includes
    /// locked records regardless of age.
    pub stale_before: Option<DateTime<Utc>>,
    pub limit: usize,
}

/// Fixed-width UTC timestamp so stored values compare lexicographically.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in DownloadStatus::INCOMPLETE {
            assert_eq!(status.as_str().parse::<DownloadStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<DownloadStatus>().is_err());
    }

    #[test]
    fn test_transition_side_effects() {
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();

        let up = StatusUpdate::for_transition(DownloadStatus::Downloading, None, now);
        assert_eq!(up.started_at, Some(now));
        assert!(up.completed_at.is_none() && !up.clear_lock);

        let up = StatusUpdate::for_transition(DownloadStatus::Failed, Some("x".into()), now);
        assert_eq!(up.completed_at, Some(now));
        assert!(up.clear_lock);

        let up = StatusUpdate::for_transition(DownloadStatus::Retrying, None, now);
        assert_eq!(up.retried_at, Some(now));
        assert!(!up.clear_lock);

        let up = StatusUpdate::for_transition(DownloadStatus::Paused, None, now);
        assert!(!up.clear_lock && up.started_at.is_none());
    }

    #[test]
    fn test_timestamps_are_fixed_width() {
        let a = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let b = a + chrono::Duration::milliseconds(1);
        let (fa, fb) = (format_timestamp(a), format_timestamp(b));
        assert_eq!(fa.len(), fb.len());
        assert!(fa < fb);
        assert_eq!(parse_timestamp(&fa), Some(a));
    }
}
