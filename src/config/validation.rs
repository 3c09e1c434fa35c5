//! Configuration validation logic.

use crate::config::loader::Config;
use crate::download::MAX_REDIRECTS;
use crate::error::{Error, Result};

fn invalid(field: &str, message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Validate the entire configuration.
pub fn validate_config(config: &Config) -> Result<()> {
    validate_http(config)?;
    validate_retry(config)?;
    validate_breaker(config)?;
    validate_state(config)?;
    validate_workers(config)?;
    Ok(())
}

fn validate_http(config: &Config) -> Result<()> {
    let http = &config.http;
    if http.timeout_seconds == 0 {
        return Err(invalid("http.timeout_seconds", "must be greater than 0"));
    }
    if http.connect_timeout_seconds == 0 {
        return Err(invalid("http.connect_timeout_seconds", "must be greater than 0"));
    }
    if http.user_agent.trim().is_empty() {
        return Err(invalid("http.user_agent", "must not be empty"));
    }
    if http.max_redirects > MAX_REDIRECTS {
        return Err(invalid(
            "http.max_redirects",
            format!("must be at most {} (got {})", MAX_REDIRECTS, http.max_redirects),
        ));
    }
    if http.password.is_some() && http.username.is_none() {
        return Err(invalid("http.password", "set without http.username"));
    }
    Ok(())
}

fn validate_retry(config: &Config) -> Result<()> {
    let retry = &config.retry;
    if retry.max_attempts == 0 {
        return Err(invalid("retry.max_attempts", "must be at least 1"));
    }
    if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
        return Err(invalid(
            "retry.multiplier",
            format!("must be at least 1.0 (got {})", retry.multiplier),
        ));
    }
    if !(0.0..=1.0).contains(&retry.jitter) {
        return Err(invalid(
            "retry.jitter",
            format!("must be between 0 and 1 (got {})", retry.jitter),
        ));
    }
    if retry.max_backoff_ms < retry.initial_backoff_ms {
        return Err(invalid(
            "retry.max_backoff_ms",
            "must not be smaller than retry.initial_backoff_ms",
        ));
    }
    Ok(())
}

fn validate_breaker(config: &Config) -> Result<()> {
    let breaker = &config.breaker;
    if !breaker.enabled {
        return Ok(());
    }
    if breaker.max_failures == 0 {
        return Err(invalid("breaker.max_failures", "must be at least 1"));
    }
    if breaker.timeout_seconds == 0 {
        return Err(invalid("breaker.timeout_seconds", "must be greater than 0"));
    }
    if breaker.max_half_open_requests == 0 {
        return Err(invalid("breaker.max_half_open_requests", "must be at least 1"));
    }
    Ok(())
}

fn validate_state(config: &Config) -> Result<()> {
    let state = &config.state;
    if state.lock_timeout_seconds == 0 {
        return Err(invalid("state.lock_timeout_seconds", "must be greater than 0"));
    }
    if state.resume_batch_limit == 0 {
        return Err(invalid("state.resume_batch_limit", "must be at least 1"));
    }
    Ok(())
}

fn validate_workers(config: &Config) -> Result<()> {
    if config.workers.concurrency == 0 {
        return Err(invalid("workers.concurrency", "must be at least 1"));
    }
    if config.workers.queue_size == 0 {
        return Err(invalid("workers.queue_size", "must be at least 1"));
    }
    Ok(())
}
