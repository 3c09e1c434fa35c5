//! Configuration structures and loading logic.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::download::{
    build_http_client, Credentials, HttpSettings, StateSettings, DEFAULT_CONCURRENCY,
    DEFAULT_QUEUE_SIZE, MAX_REDIRECTS,
};
use crate::error::{Error, Result};
use crate::resilience::{BreakerSettings, RetryPolicy};

/// Database file name inside the platform data directory.
pub const DATABASE_FILE: &str = "mediafetch.db";

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// File locations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Record database. Defaults to the platform data directory.
    #[serde(default)]
    pub database: Option<PathBuf>,

    /// Root for per-transfer temp directories. Defaults to the OS temp dir.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Base for relative destinations in batch files.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

/// HTTP client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub user_agent: String,
    pub max_redirects: usize,

    /// HTTP Basic username.
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        let defaults = HttpSettings::default();
        Self {
            timeout_seconds: defaults.timeout.as_secs(),
            connect_timeout_seconds: defaults.connect_timeout.as_secs(),
            user_agent: defaults.user_agent,
            max_redirects: MAX_REDIRECTS,
            username: None,
            password: None,
        }
    }
}

/// Retry policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            multiplier: policy.multiplier,
            jitter: policy.jitter,
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Set to false to fetch without a breaker.
    pub enabled: bool,
    pub max_failures: u32,
    pub timeout_seconds: u64,
    pub max_half_open_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        let settings = BreakerSettings::default();
        Self {
            enabled: true,
            max_failures: settings.max_failures,
            timeout_seconds: settings.timeout.as_secs(),
            max_half_open_requests: settings.max_half_open_requests,
        }
    }
}

/// Record state and locking settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub lock_timeout_seconds: u64,
    pub progress_bytes: u64,
    pub progress_seconds: u64,
    /// Records retried this many times are left out of resume sweeps.
    pub max_retries: u32,
    pub resume_batch_limit: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        let settings = StateSettings::default();
        Self {
            lock_timeout_seconds: settings.lock_timeout.as_secs(),
            progress_bytes: settings.progress_bytes,
            progress_seconds: settings.progress_interval.as_secs(),
            max_retries: 5,
            resume_batch_limit: 50,
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub concurrency: usize,
    pub queue_size: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

/// Disk housekeeping settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Temp directories older than this are removed by `cleanup`.
    pub orphan_age_hours: u64,
    /// Free space to keep when staging; 0 disables the reserve.
    pub min_free_bytes: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            orphan_age_hours: 24,
            min_free_bytes: 0,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Config(format!("Configuration file not found: {}", path.display()))
            } else {
                Error::Io(e)
            }
        })?;

        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise start from defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Effective record database path.
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.paths.database {
            return Ok(path.clone());
        }
        let dirs = ProjectDirs::from("", "", "mediafetch").ok_or_else(|| {
            Error::Config("Could not determine a data directory; set paths.database".to_string())
        })?;
        Ok(dirs.data_dir().join(DATABASE_FILE))
    }

    /// Effective temp root.
    pub fn temp_dir(&self) -> PathBuf {
        self.paths
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Resolve a destination from a batch file against `paths.output_dir`.
    pub fn resolve_destination(&self, destination: &Path) -> PathBuf {
        match &self.paths.output_dir {
            Some(base) if destination.is_relative() => base.join(destination),
            _ => destination.to_path_buf(),
        }
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            timeout: Duration::from_secs(self.http.timeout_seconds),
            connect_timeout: Duration::from_secs(self.http.connect_timeout_seconds),
            user_agent: self.http.user_agent.clone(),
            max_redirects: self.http.max_redirects,
        }
    }

    pub fn http_client(&self) -> Result<reqwest::Client> {
        build_http_client(&self.http_settings())
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.http.username.as_ref().map(|username| Credentials {
            username: username.clone(),
            password: self.http.password.clone(),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            multiplier: self.retry.multiplier,
            jitter: self.retry.jitter,
        }
    }

    /// Breaker settings, or `None` when the breaker is disabled.
    pub fn breaker_settings(&self) -> Option<BreakerSettings> {
        self.breaker.enabled.then(|| BreakerSettings {
            max_failures: self.breaker.max_failures,
            timeout: Duration::from_secs(self.breaker.timeout_seconds),
            max_half_open_requests: self.breaker.max_half_open_requests,
        })
    }

    pub fn state_settings(&self) -> StateSettings {
        StateSettings {
            lock_timeout: Duration::from_secs(self.state.lock_timeout_seconds),
            progress_bytes: self.state.progress_bytes,
            progress_interval: Duration::from_secs(self.state.progress_seconds),
        }
    }

    pub fn orphan_age(&self) -> Duration {
        Duration::from_secs(self.cleanup.orphan_age_hours * 3600)
    }
}
