use conduitcore::{Connector, HealthStatus, IntegrationError, MethodMap};
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

struct RegisteredIntegration {
    methods: MethodMap,
    connector: Option<Arc<dyn Connector>>,
}

/// Registry of named integrations callable from `integration_call` actions.
pub struct IntegrationRegistry {
    integrations: RwLock<HashMap<String, RegisteredIntegration>>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self {
            integrations: RwLock::new(HashMap::new()),
        }
    }

    /// Register a bare method map under `id`, replacing any previous entry.
    pub fn register(&self, id: impl Into<String>, methods: MethodMap) {
        let id = id.into();
        tracing::info!("Registering integration: {} ({} methods)", id, methods.len());
        self.integrations.write().insert(
            id,
            RegisteredIntegration {
                methods,
                connector: None,
            },
        );
    }

    /// Register a connector under its own id.
    pub fn register_connector(&self, connector: Arc<dyn Connector>) {
        let id = connector.id().to_string();
        let methods = connector.methods();
        tracing::info!("Registering connector: {} ({} methods)", id, methods.len());
        self.integrations.write().insert(
            id,
            RegisteredIntegration {
                methods,
                connector: Some(connector),
            },
        );
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.integrations.write().remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.integrations.read().contains_key(id)
    }

    /// Registered integration ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.integrations.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn method_names(&self, id: &str) -> Option<Vec<String>> {
        self.integrations.read().get(id).map(|entry| {
            let mut names: Vec<String> = entry.methods.keys().cloned().collect();
            names.sort();
            names
        })
    }

    pub fn connector(&self, id: &str) -> Option<Arc<dyn Connector>> {
        self.integrations
            .read()
            .get(id)
            .and_then(|entry| entry.connector.clone())
    }

    /// Invoke `method` on integration `id` with positional arguments.
    pub async fn call(
        &self,
        id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, IntegrationError> {
        let function = {
            let integrations = self.integrations.read();
            let entry = integrations
                .get(id)
                .ok_or_else(|| IntegrationError::UnknownIntegration(id.to_string()))?;
            entry
                .methods
                .get(method)
                .cloned()
                .ok_or_else(|| IntegrationError::UnknownMethod {
                    integration: id.to_string(),
                    method: method.to_string(),
                })?
        };

        tracing::debug!("Calling {}.{} with {} args", id, method, args.len());
        function(args).await
    }

    /// Health of every registered connector. Bare method maps are skipped.
    pub async fn health_check_all(&self) -> HashMap<String, HealthStatus> {
        let connectors: Vec<Arc<dyn Connector>> = self
            .integrations
            .read()
            .values()
            .filter_map(|entry| entry.connector.clone())
            .collect();

        join_all(connectors.into_iter().map(|connector| async move {
            let status = connector.health_check().await;
            (connector.id().to_string(), status)
        }))
        .await
        .into_iter()
        .collect()
    }
}

impl Default for IntegrationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conduitcore::connector::method;
    use conduitcore::ConnectorMetrics;
    use serde_json::json;

    fn echo_methods() -> MethodMap {
        let mut methods = MethodMap::new();
        methods.insert(
            "echo".to_string(),
            method(|args| async move { Ok(json!({ "args": args })) }),
        );
        methods
    }

    struct StubConnector;

    #[async_trait]
    impl Connector for StubConnector {
        fn id(&self) -> &str {
            "stub"
        }

        async fn connect(&self) -> Result<(), IntegrationError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), IntegrationError> {
            Ok(())
        }

        async fn health_check(&self) -> HealthStatus {
            HealthStatus::healthy(3, ConnectorMetrics::default())
        }

        fn metrics(&self) -> ConnectorMetrics {
            ConnectorMetrics::default()
        }

        fn methods(&self) -> MethodMap {
            echo_methods()
        }
    }

    #[tokio::test]
    async fn test_call_registered_method() {
        let registry = IntegrationRegistry::new();
        registry.register("lms", echo_methods());

        let out = registry.call("lms", "echo", vec![json!(1)]).await.unwrap();
        assert_eq!(out, json!({ "args": [1] }));
        assert_eq!(registry.list(), vec!["lms".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_integration_and_method() {
        let registry = IntegrationRegistry::new();
        registry.register("lms", echo_methods());

        assert!(matches!(
            registry.call("sso", "echo", vec![]).await,
            Err(IntegrationError::UnknownIntegration(_))
        ));
        assert!(matches!(
            registry.call("lms", "nope", vec![]).await,
            Err(IntegrationError::UnknownMethod { .. })
        ));
    }

    #[tokio::test]
    async fn test_health_check_covers_connectors_only() {
        let registry = IntegrationRegistry::new();
        registry.register("bare", echo_methods());
        registry.register_connector(Arc::new(StubConnector));

        let health = registry.health_check_all().await;
        assert_eq!(health.len(), 1);
        assert_eq!(health["stub"].latency_ms, Some(3));
        assert!(registry.connector("stub").is_some());
        assert_eq!(registry.method_names("stub"), Some(vec!["echo".to_string()]));
    }
}
