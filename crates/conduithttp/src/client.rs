use crate::auth::AuthStrategy;
use crate::rate_limit::SlidingWindowLimiter;
use conduitcore::IntegrationError;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpClientConfig {
    /// Joined with relative request paths. Absolute URLs bypass it.
    pub base_url: String,
    pub auth: AuthStrategy,
    pub default_headers: HashMap<String, String>,
    pub rate_limit_per_minute: u32,
    pub timeout_ms: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            auth: AuthStrategy::None,
            default_headers: HashMap::new(),
            rate_limit_per_minute: 60,
            timeout_ms: 30_000,
        }
    }
}

impl HttpClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_auth(mut self, auth: AuthStrategy) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit_per_minute = per_minute;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HashMap::new(),
            query: Vec::new(),
            body: None,
            timeout: None,
            cancel: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub data: Value,
    pub status_code: u16,
    pub rate_limit_remaining: u32,
    #[serde(skip)]
    pub headers: HashMap<String, String>,
}

/// Authenticated HTTP client with a per-instance sliding request quota.
///
/// Non-2xx responses become [`IntegrationError::Http`] carrying the status
/// code so a retry policy can decide whether to try again.
pub struct RateLimitedClient {
    config: HttpClientConfig,
    http: reqwest::Client,
    limiter: SlidingWindowLimiter,
    shutdown: CancellationToken,
}

impl RateLimitedClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, IntegrationError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| IntegrationError::Configuration(format!("HTTP client: {}", e)))?;
        let limiter = SlidingWindowLimiter::per_minute(config.rate_limit_per_minute);

        Ok(Self {
            config,
            http,
            limiter,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    pub async fn request(&self, options: RequestOptions) -> Result<HttpResponse, IntegrationError> {
        let url = self.resolve_url(&options.path)?;
        let timeout = options
            .timeout
            .unwrap_or(Duration::from_millis(self.config.timeout_ms));
        let cancel = options.cancel.clone().unwrap_or_default();

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(IntegrationError::Cancelled),
            _ = cancel.cancelled() => return Err(IntegrationError::Cancelled),
            _ = self.limiter.acquire() => {}
        }

        let mut builder = self.http.request(options.method.clone(), url.clone());
        for (name, value) in self.config.auth.headers() {
            builder = builder.header(name, value);
        }
        for (name, value) in self.config.default_headers.iter().chain(options.headers.iter()) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !options.query.is_empty() {
            builder = builder.query(&options.query);
        }
        if let Some(body) = &options.body {
            builder = builder.json(body);
        }

        tracing::debug!("{} {}", options.method, url);

        let exchange = async {
            let response = builder
                .send()
                .await
                .map_err(|e| IntegrationError::Transport(e.to_string()))?;
            self.read_response(response).await
        };

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(IntegrationError::Cancelled),
            _ = cancel.cancelled() => Err(IntegrationError::Cancelled),
            result = tokio::time::timeout(timeout, exchange) => match result {
                Ok(inner) => inner,
                Err(_) => {
                    tracing::warn!(
                        "{} {} timed out after {}ms",
                        options.method,
                        url,
                        timeout.as_millis()
                    );
                    Err(IntegrationError::Timeout { ms: timeout.as_millis() as u64 })
                }
            },
        }
    }

    pub async fn get(&self, path: &str) -> Result<HttpResponse, IntegrationError> {
        self.request(RequestOptions::get(path)).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<HttpResponse, IntegrationError> {
        self.request(RequestOptions::post(path, body)).await
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<HttpResponse, IntegrationError> {
        self.request(RequestOptions::new(Method::PUT, path).with_body(body))
            .await
    }

    pub async fn patch(&self, path: &str, body: Value) -> Result<HttpResponse, IntegrationError> {
        self.request(RequestOptions::new(Method::PATCH, path).with_body(body))
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<HttpResponse, IntegrationError> {
        self.request(RequestOptions::new(Method::DELETE, path)).await
    }

    /// Cancel every in-flight request and refuse new ones.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down HTTP client for '{}'", self.config.base_url);
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn resolve_url(&self, path: &str) -> Result<Url, IntegrationError> {
        let raw = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if self.config.base_url.is_empty() {
            return Err(IntegrationError::Configuration(format!(
                "relative path '{}' with no base URL",
                path
            )));
        } else {
            format!(
                "{}/{}",
                self.config.base_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        };
        Url::parse(&raw).map_err(|e| {
            IntegrationError::Configuration(format!("invalid URL '{}': {}", raw, e))
        })
    }

    async fn read_response(
        &self,
        response: reqwest::Response,
    ) -> Result<HttpResponse, IntegrationError> {
        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();

        let is_json = headers
            .get(CONTENT_TYPE.as_str())
            .is_some_and(|ct| ct.contains("json"));
        let rate_limit_remaining = headers
            .get(RATE_LIMIT_REMAINING)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or_else(|| self.limiter.remaining());

        let text = response
            .text()
            .await
            .map_err(|e| IntegrationError::Transport(e.to_string()))?;

        if !status.is_success() {
            let message = if text.is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                text
            };
            return Err(IntegrationError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let data = if text.is_empty() {
            Value::Null
        } else if is_json {
            serde_json::from_str(&text)
                .map_err(|e| IntegrationError::InvalidResponse(e.to_string()))?
        } else {
            Value::String(text)
        };

        Ok(HttpResponse {
            data,
            status_code: status.as_u16(),
            rate_limit_remaining,
            headers,
        })
    }
}
