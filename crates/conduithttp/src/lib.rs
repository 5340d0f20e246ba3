//! HTTP transport for connectors
//!
//! A rate-limited, authenticated client plus the breaker/retry guard that
//! every outbound call goes through.

mod auth;
mod client;
mod connector;
mod guarded;
pub mod rate_limit;

pub use auth::AuthStrategy;
pub use client::{HttpClientConfig, HttpResponse, RateLimitedClient, RequestOptions};
pub use connector::{RestConnector, RestConnectorConfig};
pub use guarded::GuardedHttp;
pub use rate_limit::SlidingWindowLimiter;
pub use reqwest::Method;
