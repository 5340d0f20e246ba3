//! Generic REST connector.
//!
//! Named methods map onto HTTP routes. Path segments are templated from
//! positional arguments (`/users/{{0}}`), and a route may take one
//! argument as its JSON body.

use crate::client::{HttpClientConfig, RateLimitedClient, RequestOptions};
use crate::guarded::GuardedHttp;
use async_trait::async_trait;
use conduitcore::connector::method;
use conduitcore::template::interpolate;
use conduitcore::{
    CircuitBreakerConfig, CircuitState, Connector, ConnectorMetrics, HealthState, HealthStatus,
    IntegrationError, MethodMap, RetryOptions,
};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestConnectorConfig {
    pub id: String,
    pub http: HttpClientConfig,
    #[serde(default)]
    pub retry: RetryOptions,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl RestConnectorConfig {
    pub fn new(id: impl Into<String>, http: HttpClientConfig) -> Self {
        Self {
            id: id.into(),
            http,
            retry: RetryOptions::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            health_path: default_health_path(),
        }
    }
}

#[derive(Debug, Clone)]
struct Route {
    method: Method,
    path: String,
    body_arg: Option<usize>,
}

impl Route {
    fn request(&self, args: &[Value]) -> RequestOptions {
        let scope = Value::Array(args.to_vec());
        let mut options = RequestOptions::new(self.method.clone(), interpolate(&self.path, &scope));
        if let Some(body) = self.body_arg.and_then(|i| args.get(i)) {
            options = options.with_body(body.clone());
        }
        options
    }
}

pub struct RestConnector {
    id: String,
    health_path: String,
    http: Arc<GuardedHttp>,
    routes: Vec<(String, Route)>,
    connected: AtomicBool,
}

impl RestConnector {
    pub fn new(config: RestConnectorConfig) -> Result<Self, IntegrationError> {
        let client = Arc::new(RateLimitedClient::new(config.http)?);
        let http =
            GuardedHttp::new(config.id.clone(), client, config.retry, config.circuit_breaker);

        Ok(Self {
            id: config.id,
            health_path: config.health_path,
            http: Arc::new(http),
            routes: Vec::new(),
            connected: AtomicBool::new(false),
        })
    }

    /// Expose `name` as a method issuing `method path`.
    pub fn route(
        mut self,
        name: impl Into<String>,
        method: Method,
        path: impl Into<String>,
    ) -> Self {
        self.routes.push((
            name.into(),
            Route {
                method,
                path: path.into(),
                body_arg: None,
            },
        ));
        self
    }

    /// Like [`route`](Self::route), sending argument `body_arg` as the JSON body.
    pub fn route_with_body(
        mut self,
        name: impl Into<String>,
        method: Method,
        path: impl Into<String>,
        body_arg: usize,
    ) -> Self {
        self.routes.push((
            name.into(),
            Route {
                method,
                path: path.into(),
                body_arg: Some(body_arg),
            },
        ));
        self
    }

    pub fn http(&self) -> &GuardedHttp {
        &self.http
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for RestConnector {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<(), IntegrationError> {
        let health = self.health_check().await;
        if health.status == HealthState::Unhealthy {
            let reason = health.error_message.unwrap_or_else(|| "unhealthy".to_string());
            tracing::error!("Connector '{}' failed to connect: {}", self.id, reason);
            return Err(IntegrationError::Failed(format!(
                "connector '{}' is unhealthy: {}",
                self.id, reason
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!("Connector '{}' connected", self.id);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), IntegrationError> {
        self.connected.store(false, Ordering::SeqCst);
        tracing::info!("Connector '{}' disconnected", self.id);
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        let result = self.http.request(RequestOptions::get(&self.health_path)).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let metrics = self.http.metrics();

        match result {
            Ok(_) => {
                let mut status = HealthStatus::healthy(latency_ms, metrics);
                let breaker_closed = self.http.breaker().state() == CircuitState::Closed;
                if !breaker_closed || status.metrics.error_rate() > 0.5 {
                    status.status = HealthState::Degraded;
                }
                status
            }
            Err(e) => HealthStatus::unhealthy(e.to_string(), metrics),
        }
    }

    fn metrics(&self) -> ConnectorMetrics {
        self.http.metrics()
    }

    fn methods(&self) -> MethodMap {
        self.routes
            .iter()
            .map(|(name, route)| {
                let http = self.http.clone();
                let route = route.clone();
                let call = method(move |args| {
                    let http = http.clone();
                    let options = route.request(&args);
                    async move { http.request(options).await.map(|response| response.data) }
                });
                (name.clone(), call)
            })
            .collect()
    }
}
