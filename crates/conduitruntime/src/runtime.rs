use crate::engine::WorkflowEngine;
use crate::registry::IntegrationRegistry;
use conduitcore::{ConduitError, EventBus, EventBusConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Owns the event bus, integration registry and workflow engine.
///
/// Everything is constructed explicitly here and handed to the parts
/// that need it; there is no process-wide state.
pub struct ConduitRuntime {
    config: RuntimeConfig,
    bus: EventBus,
    registry: Arc<IntegrationRegistry>,
    engine: WorkflowEngine,
}

impl ConduitRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> conduitcore::Result<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> conduitcore::Result<Self> {
        let registry = Arc::new(IntegrationRegistry::new());
        Self::with_registry(registry, config)
    }

    /// Create a new runtime with a pre-populated registry
    pub fn with_registry(
        registry: Arc<IntegrationRegistry>,
        config: RuntimeConfig,
    ) -> conduitcore::Result<Self> {
        let bus = EventBus::new(config.event_bus.clone());
        let engine = WorkflowEngine::new(bus.clone(), registry.clone(), config.engine.clone())?;

        Ok(Self {
            config,
            bus,
            registry,
            engine,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<IntegrationRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Stop timers and subscriptions, then drop every bus handler.
    pub fn shutdown(&self) {
        self.engine.shutdown();
        self.bus.clear();
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    pub event_bus: EventBusConfig,
    pub engine: EngineConfig,
}

impl RuntimeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> conduitcore::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> conduitcore::Result<Self> {
        serde_json::from_str(raw).map_err(ConduitError::from)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Per-attempt timeout for actions without their own `timeoutMs`
    pub default_action_timeout_ms: u64,
    /// First backoff between attempts of an action with `retries`
    pub action_retry_backoff_ms: u64,
    pub max_retained_runs: usize,
    /// Quota of the client shared by `http_request` actions
    pub http_rate_limit_per_minute: u32,
    pub http_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_action_timeout_ms: 30_000,
            action_retry_backoff_ms: 1_000,
            max_retained_runs: 1_000,
            http_rate_limit_per_minute: 600,
            http_timeout_ms: 30_000,
        }
    }
}

impl EngineConfig {
    pub fn default_action_timeout(&self) -> Duration {
        Duration::from_millis(self.default_action_timeout_ms)
    }

    pub fn action_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.action_retry_backoff_ms)
    }
}
