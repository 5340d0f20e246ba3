//! Core abstractions for the integration engine
//!
//! This crate provides the resilience primitives, the event bus and the
//! workflow data model that the HTTP and runtime crates build on. It does
//! no network I/O of its own.

pub mod connector;
mod error;
pub mod events;
pub mod predicate;
pub mod reliability;
mod run;
pub mod template;
mod workflow;

pub use connector::{
    Connector, ConnectorMetrics, HealthState, HealthStatus, IntegrationMethod, MethodMap,
};
pub use error::{
    ActionError, ActionFailure, CircuitOpenError, ConduitError, HandlerError, IntegrationError,
    RetryableError, WorkflowError,
};
pub use events::*;
pub use predicate::{Operator, Predicate, PredicateError};
pub use reliability::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState, RetryExecutor,
    RetryOptions,
};
pub use run::{LogLevel, RunContext, RunId, RunLog, RunStatus, WorkflowRun};
pub use workflow::{
    ActionId, ActionKind, ActionType, ConditionConfig, DelayConfig, ForeachConfig,
    HttpRequestConfig, IntegrationCallConfig, ParallelConfig, TransformConfig, TriggerSpec,
    Workflow, WorkflowAction, WorkflowId,
};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, ConduitError>;
