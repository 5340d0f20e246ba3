//! Capability contract every external integration satisfies.
//!
//! A connector owns its transport and resilience state. The workflow
//! engine only ever sees it through [`Connector::methods`], a map of named
//! async functions taking positional JSON arguments.

use crate::IntegrationError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub type IntegrationMethod =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, IntegrationError>> + Send + Sync>;

pub type MethodMap = HashMap<String, IntegrationMethod>;

/// Wrap an async closure as an [`IntegrationMethod`].
pub fn method<F, Fut>(f: F) -> IntegrationMethod
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, IntegrationError>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorMetrics {
    pub requests: u64,
    pub failures: u64,
    pub average_latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ConnectorMetrics {
    pub fn record(&mut self, latency_ms: f64, error: Option<String>) {
        self.requests += 1;
        let n = self.requests as f64;
        self.average_latency_ms += (latency_ms - self.average_latency_ms) / n;
        if let Some(e) = error {
            self.failures += 1;
            self.last_error = Some(e);
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.failures as f64 / self.requests as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: HealthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub metrics: ConnectorMetrics,
}

impl HealthStatus {
    pub fn healthy(latency_ms: u64, metrics: ConnectorMetrics) -> Self {
        Self {
            status: HealthState::Healthy,
            latency_ms: Some(latency_ms),
            error_message: None,
            metrics,
        }
    }

    pub fn unhealthy(error: impl Into<String>, metrics: ConnectorMetrics) -> Self {
        Self {
            status: HealthState::Unhealthy,
            latency_ms: None,
            error_message: Some(error.into()),
            metrics,
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn id(&self) -> &str;

    async fn connect(&self) -> Result<(), IntegrationError>;

    async fn disconnect(&self) -> Result<(), IntegrationError>;

    async fn health_check(&self) -> HealthStatus;

    fn metrics(&self) -> ConnectorMetrics;

    /// Named operations exposed to `integration_call` actions.
    fn methods(&self) -> MethodMap;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metrics_track_running_average() {
        let mut m = ConnectorMetrics::default();
        m.record(10.0, None);
        m.record(30.0, Some("HTTP 500: boom".into()));
        assert_eq!(m.requests, 2);
        assert_eq!(m.failures, 1);
        assert!((m.average_latency_ms - 20.0).abs() < f64::EPSILON);
        assert_eq!(m.last_error.as_deref(), Some("HTTP 500: boom"));
        assert!((m.error_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn method_wraps_closure() {
        let echo = method(|args| async move { Ok(json!({ "args": args })) });
        let out = echo(vec![json!(1), json!("a")]).await.unwrap();
        assert_eq!(out, json!({ "args": [1, "a"] }));
    }

    #[test]
    fn health_status_wire_shape() {
        let h = HealthStatus::unhealthy("down", ConnectorMetrics::default());
        let v = serde_json::to_value(&h).unwrap();
        assert_eq!(v["status"], "unhealthy");
        assert_eq!(v["errorMessage"], "down");
        assert!(v.get("latencyMs").is_none());
    }
}
