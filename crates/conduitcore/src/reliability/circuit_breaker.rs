//! Per-connector circuit breaker
//!
//! ```text
//! ┌────────┐ failures >= threshold ┌──────┐ cool-down elapsed ┌──────────┐
//! │ Closed │ ────────────────────► │ Open │ ────────────────► │ HalfOpen │
//! └────────┘                       └──────┘                   └──────────┘
//!      ▲                               ▲      trial fails          │
//!      │                               └───────────────────────────┤
//!      │                  trial succeeds                           │
//!      └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Exactly one trial call is admitted per cool-down expiry. The failure
//! count survives the move to half-open, so a failed trial re-opens at once.

use crate::error::CircuitOpenError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Cool-down measured from the last failure
    #[serde(rename = "timeoutMs", with = "super::duration_millis")]
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub millis_since_last_failure: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// Guards one dependency. Never shared across connectors.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            millis_since_last_failure: inner
                .last_failure
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
    }

    /// Run `f` unless the circuit is open. A rejected call never invokes `f`.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        let mut trial = self.admit()?;

        let result = f().await;
        trial.settled = true;
        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result
    }

    fn admit(&self) -> Result<TrialGuard<'_>, CircuitOpenError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(TrialGuard::passive(self)),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.timeout);
                if elapsed >= self.config.timeout {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!(
                        "Circuit breaker '{}' half-open, admitting trial call",
                        self.name
                    );
                    Ok(TrialGuard::trial(self))
                } else {
                    Err(CircuitOpenError {
                        name: self.name.clone(),
                        retry_after: self.config.timeout - elapsed,
                    })
                }
            }
            // A trial is already in flight
            CircuitState::HalfOpen => Err(CircuitOpenError {
                name: self.name.clone(),
                retry_after: Duration::ZERO,
            }),
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!("Circuit breaker '{}' closed", self.name);
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        let should_open = inner.state == CircuitState::HalfOpen
            || inner.failure_count >= self.config.failure_threshold;
        if should_open && inner.state != CircuitState::Open {
            tracing::warn!(
                "Circuit breaker '{}' opened after {} failures",
                self.name,
                inner.failure_count
            );
            inner.state = CircuitState::Open;
        }
    }
}

/// Returns a half-open breaker to open if its trial call is dropped
/// before producing an outcome.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    is_trial: bool,
    settled: bool,
}

impl<'a> TrialGuard<'a> {
    fn passive(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            is_trial: false,
            settled: false,
        }
    }

    fn trial(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            is_trial: true,
            settled: false,
        }
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.is_trial && !self.settled {
            let mut inner = self.breaker.inner.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.state = CircuitState::Open;
            }
        }
    }
}
