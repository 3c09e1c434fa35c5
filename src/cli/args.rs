//! Command-line argument definitions using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

/// Resumable media downloader CLI.
#[derive(Parser, Debug)]
#[command(
    name = "mediafetch",
    version,
    about = "Resumable, lock-coordinated media downloads",
    long_about = "Download media files over HTTP with retries, range resume and a shared record \
                  store.\n\nSeveral instances may share one database; a record is downloaded by \
                  at most one of them at a time."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file.
    #[arg(short, long, global = true, default_value = "mediafetch.toml", env = "MEDIAFETCH_CONFIG")]
    pub config: PathBuf,

    /// Record database path.
    #[arg(long, global = true, env = "MEDIAFETCH_DATABASE")]
    pub database: Option<PathBuf>,

    /// Root for temporary download directories.
    #[arg(long = "temp-dir", global = true, env = "MEDIAFETCH_TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,

    /// HTTP Basic username.
    #[arg(long, global = true, env = "MEDIAFETCH_USERNAME")]
    pub username: Option<String>,

    /// HTTP Basic password.
    #[arg(long, global = true, env = "MEDIAFETCH_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Hide progress bars and per-job lines.
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Enable debug logging.
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download one URL.
    Get {
        url: String,

        /// Destination path without extension.
        dest_base: PathBuf,

        /// Report to an existing record instead of one keyed by URL.
        #[arg(long)]
        record: Option<i64>,

        /// Do not create or update a record.
        #[arg(long)]
        untracked: bool,
    },

    /// Download every `URL<TAB>DEST_BASE` line of a file.
    Batch {
        file: PathBuf,

        /// Concurrent workers.
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
    },

    /// Re-run incomplete records.
    Resume {
        /// Maximum records to pick up.
        #[arg(long)]
        limit: Option<usize>,

        /// Skip records retried this many times (0 disables the filter).
        #[arg(long)]
        max_retries: Option<u32>,

        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
    },

    /// List incomplete records.
    Status {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,

        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Reclaim stale locks and remove orphaned temp directories.
    Cleanup {
        /// Override the orphan age, in hours.
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}

impl Args {
    /// Merge CLI arguments into an existing config, overriding where specified.
    pub fn merge_into_config(&self, config: &mut Config) {
        if let Some(database) = &self.database {
            config.paths.database = Some(database.clone());
        }

        if let Some(temp_dir) = &self.temp_dir {
            config.paths.temp_dir = Some(temp_dir.clone());
        }

        if let Some(username) = &self.username {
            config.http.username = Some(username.clone());
        }

        if let Some(password) = &self.password {
            config.http.password = Some(password.clone());
        }

        match &self.command {
            Command::Batch { concurrency, .. } => {
                if let Some(n) = concurrency {
                    config.workers.concurrency = *n;
                }
            }
            Command::Resume {
                limit,
                max_retries,
                concurrency,
            } => {
                if let Some(limit) = limit {
                    config.state.resume_batch_limit = *limit;
                }
                if let Some(max_retries) = max_retries {
                    config.state.max_retries = *max_retries;
                }
                if let Some(n) = concurrency {
                    config.workers.concurrency = *n;
                }
            }
            Command::Cleanup {
                older_than_hours: Some(hours),
            } => config.cleanup.orphan_age_hours = *hours,
            _ => {}
        }
    }
}
