//! mediafetch - CLI entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use mediafetch::{
    cli::{load_batch_jobs, Args, Command},
    config::{validate_config, Config},
    download::{DownloadJob, Downloader, ParallelDownloader, StateManager},
    error::{exit_codes, Error, ErrorKind, Result},
    fs::{cleanup_orphaned_temp, format_bytes},
    output::{
        apply_progress, create_byte_spinner, print_banner, print_batch_stats,
        print_config_summary, print_error, print_info, print_outcome, print_records,
        print_success, print_warning, BatchStats,
    },
    resilience::CircuitBreaker,
    store::{RecordStore, SqliteStore},
};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            print_error(&format!("{}", e));
            let code = match e {
                Error::Config(_) | Error::ConfigValidation { .. } | Error::TomlParse(_) => {
                    exit_codes::CONFIG_ERROR
                }
                e => match e.kind() {
                    ErrorKind::Cancelled => exit_codes::ABORT,
                    ErrorKind::ExternalService | ErrorKind::Validation | ErrorKind::Busy => {
                        exit_codes::DOWNLOAD_ERROR
                    }
                    ErrorKind::Internal | ErrorKind::NotFound => exit_codes::UNEXPECTED_ERROR,
                },
            };
            ExitCode::from(code as u8)
        }
    }
}

/// Everything a subcommand needs, wired from the config.
struct Engine {
    config: Config,
    state: Arc<StateManager>,
    downloader: Arc<Downloader>,
}

impl Engine {
    fn build(config: Config) -> Result<Self> {
        let database = config.database_path()?;
        let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(&database)?);
        let state = Arc::new(StateManager::new(store, config.state_settings()));

        let mut downloader = Downloader::new(config.http_client()?)
            .with_state(Arc::clone(&state))
            .with_retry(config.retry_policy())
            .with_temp_root(config.temp_dir())
            .with_min_free_bytes(config.cleanup.min_free_bytes);
        if let Some(settings) = config.breaker_settings() {
            downloader = downloader.with_breaker(Arc::new(CircuitBreaker::new("http", settings)));
        }
        if let Some(credentials) = config.credentials() {
            downloader = downloader.with_credentials(credentials);
        }

        Ok(Self {
            config,
            state,
            downloader: Arc::new(downloader),
        })
    }

    fn pool(&self) -> ParallelDownloader {
        ParallelDownloader::new(Arc::clone(&self.downloader), self.config.workers.concurrency)
            .with_queue_size(self.config.workers.queue_size)
    }
}

async fn run() -> Result<i32> {
    // Parse CLI arguments
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    fmt().with_env_filter(filter).with_target(false).init();

    if !args.quiet {
        print_banner();
    }

    // Load configuration
    let mut config = Config::load_or_default(&args.config)?;
    args.merge_into_config(&mut config);
    validate_config(&config)?;

    let engine = Engine::build(config)?;
    if !args.quiet {
        print_config_summary(
            &engine.config.database_path()?.display().to_string(),
            &engine.config.temp_dir().display().to_string(),
            engine.config.workers.concurrency,
            engine.state.instance_id(),
        );
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                print_warning("Interrupted, stopping downloads...");
                cancel.cancel();
            }
        });
    }

    match args.command {
        Command::Get {
            url,
            dest_base,
            record,
            untracked,
        } => run_get(&engine, url, dest_base, record, untracked, args.quiet, &cancel).await,
        Command::Batch { file, .. } => {
            let jobs = load_batch_jobs(&file, &engine.config)?;
            if jobs.is_empty() {
                print_warning(&format!("No jobs in {}", file.display()));
                return Ok(exit_codes::SUCCESS);
            }
            print_info(&format!("Queued {} download(s)", jobs.len()));
            Ok(run_batch(&engine, jobs, args.quiet, cancel).await)
        }
        Command::Resume { .. } => run_resume(&engine, args.quiet, cancel).await,
        Command::Status { json, limit } => run_status(&engine, json, limit).await,
        Command::Cleanup { .. } => run_cleanup(&engine).await,
    }
}

async fn run_get(
    engine: &Engine,
    url: String,
    dest_base: PathBuf,
    record: Option<i64>,
    untracked: bool,
    quiet: bool,
    cancel: &CancellationToken,
) -> Result<i32> {
    let mut job = DownloadJob::new(url, dest_base);
    job = match (record, untracked) {
        (Some(id), _) => job.with_record(id),
        (None, false) => job.tracked(None),
        (None, true) => job,
    };

    let bar = (!quiet).then(create_byte_spinner);
    if let Some(bar) = bar.clone() {
        job = job.with_progress(move |progress| apply_progress(&bar, progress));
    }

    let result = engine.downloader.download(&job, cancel).await;
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    let result = result?;
    print_success(&format!(
        "Saved {} ({}) in {:.1}s",
        result.file_path.display(),
        format_bytes(result.file_size),
        result.duration.as_secs_f64()
    ));
    Ok(exit_codes::SUCCESS)
}

async fn run_batch(
    engine: &Engine,
    jobs: Vec<DownloadJob>,
    quiet: bool,
    cancel: CancellationToken,
) -> i32 {
    let mut outcomes = engine.pool().spawn(jobs, cancel);
    let mut stats = BatchStats::default();

    while let Some(outcome) = outcomes.recv().await {
        if !quiet {
            print_outcome(&outcome);
        }
        stats.record(&outcome);
    }

    print_batch_stats(&stats);

    if stats.has_failures() {
        exit_codes::SOME_JOBS_FAILED
    } else if stats.cancelled > 0 {
        exit_codes::ABORT
    } else {
        exit_codes::SUCCESS
    }
}

async fn run_resume(engine: &Engine, quiet: bool, cancel: CancellationToken) -> Result<i32> {
    let records = engine
        .state
        .get_incomplete_downloads(
            engine.config.state.max_retries,
            engine.config.state.resume_batch_limit,
        )
        .await?;

    let mut jobs = Vec::with_capacity(records.len());
    for record in records {
        match (&record.source_url, &record.destination_base) {
            (Some(url), Some(dest)) => jobs.push(
                DownloadJob::new(url.clone(), dest.clone())
                    .with_id(format!("record {}", record.id))
                    .with_record(record.id),
            ),
            _ => print_warning(&format!(
                "Record {} has no source or destination, skipping",
                record.id
            )),
        }
    }

    if jobs.is_empty() {
        print_info("Nothing to resume");
        return Ok(exit_codes::SUCCESS);
    }
    print_info(&format!("Resuming {} download(s)", jobs.len()));
    Ok(run_batch(engine, jobs, quiet, cancel).await)
}

async fn run_status(engine: &Engine, json: bool, limit: usize) -> Result<i32> {
    let records = engine.state.list_incomplete(limit).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print_records(&records);
    }
    Ok(exit_codes::SUCCESS)
}

async fn run_cleanup(engine: &Engine) -> Result<i32> {
    let reclaimed = engine.state.cleanup_stale_locks().await?;
    print_info(&format!("Reclaimed {} stale lock(s)", reclaimed));

    let report = cleanup_orphaned_temp(&engine.config.temp_dir(), engine.config.orphan_age()).await?;
    print_info(&format!(
        "Removed {} orphaned temp dir(s), freed {}",
        report.removed.len(),
        format_bytes(report.bytes_freed)
    ));
    if report.errors > 0 {
        print_warning(&format!(
            "{} temp dir(s) could not be removed",
            report.errors
        ));
    }

    Ok(if report.errors == 0 {
        exit_codes::SUCCESS
    } else {
        exit_codes::UNEXPECTED_ERROR
    })
}
