//! Circuit breaker for a single downstream dependency.
//!
//! # State Machine
//!
//! ```text
//! Closed   --[max_failures consecutive failures]--> Open
//! Open     --[timeout elapsed, next call]---------> HalfOpen (call runs as probe)
//! HalfOpen --[probe succeeds]---------------------> Closed
//! HalfOpen --[probe fails]------------------------> Open
//! ```
//!
//! A half-open call that is dropped before it finishes, or whose outcome is
//! [`CallOutcome::Ignored`], hands its slot back without a transition.
//!
//! Every transition starts a new generation and zeroes the counters, so a
//! call that started under an older generation cannot move the current one.
//! The breaker knows nothing about HTTP; it wraps any fallible future.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::Error;

/// Breaker tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    /// Consecutive failures in `Closed` that open the circuit.
    pub max_failures: u32,
    /// How long the circuit stays open before a probe is allowed.
    pub timeout: Duration,
    /// Concurrent probes allowed while half-open.
    pub max_half_open_requests: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_failures: 5,
            timeout: Duration::from_secs(60),
            max_half_open_requests: 1,
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// How a finished call bears on the dependency's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    /// Says nothing about the dependency (cancelled, local error).
    Ignored,
}

impl From<bool> for CallOutcome {
    fn from(success: bool) -> Self {
        if success {
            CallOutcome::Success
        } else {
            CallOutcome::Failure
        }
    }
}

/// Why a call was refused without being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Open,
    TooManyRequests,
}

impl From<Rejection> for Error {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Open => Error::BreakerOpen,
            Rejection::TooManyRequests => Error::TooManyRequests,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    generation: u64,
    consecutive_failures: u32,
    in_flight_probes: u32,
    changed_at: Instant,
}

impl Inner {
    fn transition(&mut self, name: &str, to: BreakerState, now: Instant) {
        tracing::info!(breaker = name, from = %self.state, to = %to, "Circuit breaker transition");
        self.state = to;
        self.generation += 1;
        self.consecutive_failures = 0;
        self.in_flight_probes = 0;
        self.changed_at = now;
    }
}

/// Generic circuit breaker.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("inner", &self.inner)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                consecutive_failures: 0,
                in_flight_probes: 0,
                changed_at: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. An expired `Open` still reads as `Open` until the
    /// next call probes it.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Run `op` through the breaker; any `Err` counts as a failure.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Rejection>,
    {
        self.call_with(op, |result| result.is_ok()).await
    }

    /// Run `op` through the breaker, judging the outcome with `judge`.
    ///
    /// Dropping the returned future before `op` finishes releases its slot.
    pub async fn call_with<T, E, F, Fut, J, O>(&self, op: F, judge: J) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Rejection>,
        J: FnOnce(&Result<T, E>) -> O,
        O: Into<CallOutcome>,
    {
        let permit = self.before_call().map_err(E::from)?;
        let result = op().await;
        permit.settle(judge(&result).into());
        result
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn before_call(&self) -> Result<Permit<'_>, Rejection> {
        let generation = self.admit()?;
        Ok(Permit {
            breaker: self,
            generation,
            settled: false,
        })
    }

    fn admit(&self) -> Result<u64, Rejection> {
        let mut inner = self.lock();
        let now = Instant::now();

        match inner.state {
            BreakerState::Closed => Ok(inner.generation),
            BreakerState::Open => {
                if now.duration_since(inner.changed_at) < self.settings.timeout {
                    return Err(Rejection::Open);
                }
                inner.transition(&self.name, BreakerState::HalfOpen, now);
                inner.in_flight_probes = 1;
                Ok(inner.generation)
            }
            BreakerState::HalfOpen => {
                if inner.in_flight_probes >= self.settings.max_half_open_requests.max(1) {
                    return Err(Rejection::TooManyRequests);
                }
                inner.in_flight_probes += 1;
                Ok(inner.generation)
            }
        }
    }

    fn after_call(&self, generation: u64, success: bool) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        let now = Instant::now();

        match (inner.state, success) {
            (BreakerState::Closed, true) => inner.consecutive_failures = 0,
            (BreakerState::Closed, false) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.settings.max_failures.max(1) {
                    inner.transition(&self.name, BreakerState::Open, now);
                }
            }
            (BreakerState::HalfOpen, true) => {
                inner.transition(&self.name, BreakerState::Closed, now)
            }
            (BreakerState::HalfOpen, false) => {
                inner.transition(&self.name, BreakerState::Open, now)
            }
            (BreakerState::Open, _) => {}
        }
    }

    /// Hand back a probe slot without judging the dependency.
    fn release(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation && inner.state == BreakerState::HalfOpen {
            inner.in_flight_probes = inner.in_flight_probes.saturating_sub(1);
        }
    }
}

/// Admission to one call; releases its slot if dropped unsettled.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, outcome: CallOutcome) {
        self.settled = true;
        match outcome {
            CallOutcome::Success => self.breaker.after_call(self.generation, true),
            CallOutcome::Failure => self.breaker.after_call(self.generation, false),
            CallOutcome::Ignored => self.breaker.release(self.generation),
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(breaker = %self.breaker.name, "Call dropped before completion");
            self.breaker.release(self.generation);
        }
    }
}
