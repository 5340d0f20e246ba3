use crate::client::{HttpResponse, RateLimitedClient, RequestOptions};
use conduitcore::{
    CircuitBreaker, CircuitBreakerConfig, ConnectorMetrics, IntegrationError, RetryExecutor,
    RetryOptions,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;

/// A rate-limited client wrapped in a retry policy, wrapped in a
/// circuit breaker. Every call is recorded in [`ConnectorMetrics`].
pub struct GuardedHttp {
    client: Arc<RateLimitedClient>,
    breaker: CircuitBreaker,
    retry: RetryExecutor,
    metrics: Mutex<ConnectorMetrics>,
}

impl GuardedHttp {
    pub fn new(
        name: impl Into<String>,
        client: Arc<RateLimitedClient>,
        retry: RetryOptions,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            client,
            breaker: CircuitBreaker::with_config(name, breaker),
            retry: RetryExecutor::new(retry),
            metrics: Mutex::new(ConnectorMetrics::default()),
        }
    }

    pub fn client(&self) -> &RateLimitedClient {
        &self.client
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn metrics(&self) -> ConnectorMetrics {
        self.metrics.lock().clone()
    }

    pub async fn request(&self, options: RequestOptions) -> Result<HttpResponse, IntegrationError> {
        let started = Instant::now();

        let result = self
            .breaker
            .execute(|| self.retry.execute(|| self.client.request(options.clone())))
            .await;

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let error = result.as_ref().err().map(ToString::to_string);
        if let Some(e) = &error {
            tracing::warn!("{} {} failed: {}", options.method, options.path, e);
        }
        self.metrics.lock().record(latency_ms, error);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HttpClientConfig;
    use conduitcore::CircuitState;
    use std::time::Duration;

    #[tokio::test]
    async fn open_breaker_fails_fast_without_touching_client() {
        let config = HttpClientConfig::new("http://127.0.0.1:9");
        let client = Arc::new(RateLimitedClient::new(config).unwrap());
        let guarded = GuardedHttp::new(
            "lms",
            client,
            RetryOptions::no_retry(),
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_timeout(Duration::from_secs(60)),
        );

        let first = guarded.request(RequestOptions::get("/health")).await;
        assert!(first.is_err());
        assert_eq!(guarded.breaker().state(), CircuitState::Open);

        let second = guarded.request(RequestOptions::get("/health")).await;
        assert!(matches!(second, Err(IntegrationError::CircuitOpen(_))));
        // Local window only counts the request that actually went out
        assert_eq!(guarded.client().limiter().remaining(), 59);

        let metrics = guarded.metrics();
        assert_eq!(metrics.requests, 2);
        assert_eq!(metrics.failures, 2);
    }
}
