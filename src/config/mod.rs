//! Configuration module.
//!
//! This module handles:
//! - Loading configuration from TOML files
//! - Conversion into engine settings
//! - Configuration validation

pub mod loader;
pub mod validation;

pub use loader::{
    BreakerConfig, CleanupConfig, Config, HttpConfig, PathsConfig, RetryConfig, StateConfig,
    WorkersConfig, DATABASE_FILE,
};
pub use validation::validate_config;
