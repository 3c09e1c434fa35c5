//! Resilience primitives wrapped around networked calls.
//!
//! This module provides:
//! - Exponential backoff with jitter and cancellable waits
//! - A generic circuit breaker

pub mod breaker;
pub mod retry;

pub use breaker::{BreakerSettings, BreakerState, CallOutcome, CircuitBreaker};
pub use retry::RetryPolicy;
