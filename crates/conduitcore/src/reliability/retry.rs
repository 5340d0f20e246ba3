//! Bounded retries with exponential backoff

use crate::error::RetryableError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

/// Options for a single [`RetryExecutor::execute_with`] call.
///
/// Delay before retry `k` (1-based) is
/// `min(initial_backoff * multiplier^(k-1), max_backoff)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryOptions {
    /// Retries after the initial attempt. Zero runs the operation once.
    pub max_retries: u32,

    #[serde(with = "super::duration_millis")]
    pub initial_backoff: Duration,

    pub multiplier: f64,

    #[serde(with = "super::duration_millis")]
    pub max_backoff: Duration,

    /// Status codes eligible for retry. Errors without a status code are
    /// always retried; `None` retries every status.
    pub retry_on: Option<HashSet<u16>>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1000),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(30_000),
            retry_on: Some([408, 429, 500, 502, 503, 504].into_iter().collect()),
        }
    }
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run once, never retry.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_retry_on(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retry_on = Some(codes.into_iter().collect());
        self
    }

    pub fn retry_all_statuses(mut self) -> Self {
        self.retry_on = None;
        self
    }

    /// Delay slept before retry `retry` (1-based).
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(0.0).powi(retry as i32 - 1);
        let base = self.initial_backoff.as_secs_f64() * factor;
        if !base.is_finite() || base >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        self.initial_backoff.mul_f64(factor)
    }

    /// Whether an error with this status code may be retried.
    pub fn is_retryable(&self, status: Option<u16>) -> bool {
        match (status, &self.retry_on) {
            (Some(code), Some(codes)) => codes.contains(&code),
            _ => true,
        }
    }
}

/// Runs async operations with selectively retried exponential backoff.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    defaults: RetryOptions,
}

impl RetryExecutor {
    pub fn new(defaults: RetryOptions) -> Self {
        Self { defaults }
    }

    pub fn options(&self) -> &RetryOptions {
        &self.defaults
    }

    /// Execute with the executor's default options.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError + std::fmt::Display,
    {
        self.execute_with(op, &self.defaults).await
    }

    /// Execute `op`, failing with the last error once `max_retries` is exhausted.
    pub async fn execute_with<T, E, F, Fut>(
        &self,
        mut op: F,
        options: &RetryOptions,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError + std::fmt::Display,
    {
        let mut retry = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if err.is_permanent() || !options.is_retryable(err.status_code()) {
                        tracing::debug!("Not retrying non-retryable error: {}", err);
                        return Err(err);
                    }
                    if retry >= options.max_retries {
                        tracing::warn!("Giving up after {} retries: {}", retry, err);
                        return Err(err);
                    }

                    retry += 1;
                    let delay = options.delay_for_attempt(retry);
                    tracing::debug!(
                        "Attempt {} failed ({}), retrying in {}ms",
                        retry,
                        err,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IntegrationError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn http(status: u16) -> IntegrationError {
        IntegrationError::Http {
            status,
            message: "failed".to_string(),
        }
    }

    #[test]
    fn test_delay_schedule_is_capped() {
        let options = RetryOptions::new()
            .with_initial_backoff(Duration::from_millis(100))
            .with_multiplier(2.0)
            .with_max_backoff(Duration::from_millis(350));

        assert_eq!(options.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(options.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(options.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(options.delay_for_attempt(4), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let options = RetryOptions::new()
            .with_max_retries(3)
            .with_initial_backoff(Duration::from_millis(100));
        let executor = RetryExecutor::new(options);

        let started = Instant::now();
        let counter = calls.clone();
        let result: Result<&str, IntegrationError> = executor
            .execute(|| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(http(503))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_outside_retry_on_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(RetryOptions::new().with_retry_on([503]));

        let counter = calls.clone();
        let result: Result<(), IntegrationError> = executor
            .execute(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(http(404))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().status_code(), Some(404));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::default();

        let counter = calls.clone();
        let result: Result<(), IntegrationError> = executor
            .execute_with(
                || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(IntegrationError::Transport("down".to_string()))
                    }
                },
                &RetryOptions::no_retry(),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(
            RetryOptions::new()
                .with_max_retries(2)
                .with_initial_backoff(Duration::from_millis(10)),
        );

        let counter = calls.clone();
        let result: Result<(), IntegrationError> = executor
            .execute(|| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    Err(IntegrationError::Failed(format!("attempt {}", n)))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().to_string(), "attempt 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_options_serde_uses_millis() {
        let json = serde_json::json!({
            "maxRetries": 2,
            "initialBackoff": 250,
            "multiplier": 3.0,
            "maxBackoff": 1000,
            "retryOn": [503]
        });
        let options: RetryOptions = serde_json::from_value(json).unwrap();
        assert_eq!(options.initial_backoff, Duration::from_millis(250));
        assert!(options.is_retryable(Some(503)));
        assert!(!options.is_retryable(Some(500)));
        assert!(options.is_retryable(None));
    }
}
