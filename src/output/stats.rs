//! Statistics reporting.

use console::style;

use crate::download::JobOutcome;
use crate::error::{Error, ErrorKind};
use crate::fs::format_bytes;
use crate::store::DownloadRecord;

/// Tally of one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub succeeded: u64,
    pub failed: u64,
    /// Skipped because another instance holds the record lock.
    pub busy: u64,
    pub cancelled: u64,
    pub bytes: u64,
}

impl BatchStats {
    pub fn record(&mut self, outcome: &JobOutcome) {
        match &outcome.result {
            Ok(result) => {
                self.succeeded += 1;
                self.bytes += result.file_size;
            }
            Err(Error::LockHeld(_)) => self.busy += 1,
            Err(e) if e.kind() == ErrorKind::Cancelled => self.cancelled += 1,
            Err(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.succeeded + self.failed + self.busy + self.cancelled
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// Print one line per finished job.
pub fn print_outcome(outcome: &JobOutcome) {
    match &outcome.result {
        Ok(result) => println!(
            "{} {} -> {} ({}, {} attempt{})",
            style("OK").green().bold(),
            outcome.job_id,
            result.file_path.display(),
            format_bytes(result.file_size),
            result.attempts,
            if result.attempts == 1 { "" } else { "s" }
        ),
        Err(Error::LockHeld(id)) => println!(
            "{} {} (record {} is locked elsewhere)",
            style("BUSY").yellow().bold(),
            outcome.job_id,
            id
        ),
        Err(e) => println!(
            "{} {} [{}] {}",
            style("FAIL").red().bold(),
            outcome.job_id,
            e.kind(),
            e
        ),
    }
}

/// Print batch statistics.
pub fn print_batch_stats(stats: &BatchStats) {
    println!();
    println!("{}", style("═".repeat(50)).dim());
    println!("{}", style("Batch Statistics:").bold());
    println!("  Jobs:       {}", stats.total());
    println!("  Succeeded:  {}", style(stats.succeeded).green());
    if stats.failed > 0 {
        println!("  Failed:     {}", style(stats.failed).red());
    }
    if stats.busy > 0 {
        println!("  Busy:       {} (locked elsewhere)", style(stats.busy).yellow());
    }
    if stats.cancelled > 0 {
        println!("  Cancelled:  {}", style(stats.cancelled).yellow());
    }
    println!("  Downloaded: {}", format_bytes(stats.bytes));
    println!("{}", style("═".repeat(50)).dim());
}

/// Print records as a table.
pub fn print_records(records: &[DownloadRecord]) {
    if records.is_empty() {
        println!("No incomplete downloads.");
        return;
    }

    println!(
        "{}",
        style(format!(
            "{:>6}  {:<11}  {:>7}  {:>19}  {}",
            "ID", "STATUS", "RETRIES", "PROGRESS", "SOURCE"
        ))
        .bold()
    );
    for record in records {
        let done = record.bytes_downloaded.unwrap_or(0);
        let progress = match record.total_bytes {
            Some(total) => format!("{}/{}", format_bytes(done), format_bytes(total)),
            None => format_bytes(done),
        };
        let locked = if record.locked_by.is_some() { " (locked)" } else { "" };
        println!(
            "{:>6}  {:<11}  {:>7}  {:>19}  {}{}",
            record.id,
            record.status.as_str(),
            record.retry_count,
            progress,
            record.source_url.as_deref().unwrap_or("-"),
            locked
        );
    }
}
