//! Error types for the mediafetch engine.

use std::fmt;

use thiserror::Error;

/// Main error type for the engine and CLI.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration value for '{field}': {message}")]
    ConfigValidation { field: String, message: String },

    // Caller input errors
    #[error("Invalid download request: {0}")]
    InvalidRequest(String),

    // HTTP errors
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Server resumed at byte {actual}, requested {requested}")]
    RangeMismatch { requested: u64, actual: u64 },

    #[error("Malformed Content-Range header: {0}")]
    ContentRange(String),

    // Breaker errors
    #[error("Circuit breaker is open")]
    BreakerOpen,

    #[error("Circuit breaker is half-open: too many requests")]
    TooManyRequests,

    // Record and lock errors
    #[error("Download record {0} is locked by another worker")]
    LockHeld(i64),

    #[error("Download record not found: {0}")]
    RecordNotFound(i64),

    // File system errors
    #[error("Insufficient disk space: need {required} bytes, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("File placement failed: {0}")]
    Placement(String),

    #[error("Download cancelled")]
    Cancelled,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification consumers branch on instead of message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad caller input. Never retried.
    Validation,
    /// Network or HTTP failure. Retried per policy.
    ExternalService,
    /// Filesystem or database failure. Surfaced immediately.
    Internal,
    /// Record lookup miss.
    NotFound,
    /// Another worker holds the record's lock; skip it for now.
    Busy,
    /// The caller cancelled the operation.
    Cancelled,
}

impl ErrorKind {
    /// Whether the retry policy may try again after an error of this kind.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::ExternalService)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::ExternalService => write!(f, "external-service"),
            ErrorKind::Internal => write!(f, "internal"),
            ErrorKind::NotFound => write!(f, "not-found"),
            ErrorKind::Busy => write!(f, "busy"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_)
            | Error::ConfigValidation { .. }
            | Error::InvalidRequest(_)
            | Error::TomlParse(_)
            | Error::UrlParse(_) => ErrorKind::Validation,

            Error::HttpStatus { .. }
            | Error::Stream(_)
            | Error::RangeMismatch { .. }
            | Error::ContentRange(_)
            | Error::BreakerOpen
            | Error::TooManyRequests
            | Error::Http(_) => ErrorKind::ExternalService,

            Error::InsufficientSpace { .. }
            | Error::Placement(_)
            | Error::Io(_)
            | Error::Database(_)
            | Error::Json(_) => ErrorKind::Internal,

            Error::RecordNotFound(_) => ErrorKind::NotFound,
            Error::LockHeld(_) => ErrorKind::Busy,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Shorthand for `self.kind().is_retryable()`.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Process exit codes for the CLI.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const ABORT: i32 = 1;
    pub const CONFIG_ERROR: i32 = 3;
    pub const DOWNLOAD_ERROR: i32 = 4;
    pub const UNEXPECTED_ERROR: i32 = 5;
    pub const SOME_JOBS_FAILED: i32 = 6;
}
