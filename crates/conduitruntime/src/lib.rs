//! Workflow execution runtime
//!
//! This crate provides the engine that wires workflow triggers to the
//! event bus and timers, walks action graphs, and dispatches
//! `integration_call` actions through the integration registry.

mod engine;
mod executor;
mod registry;
mod runtime;
mod scheduler;
mod store;

pub use engine::{
    WorkflowEngine, ENGINE_INTEGRATION_ID, WORKFLOW_COMPLETED, WORKFLOW_FAILED, WORKFLOW_STARTED,
};
pub use registry::IntegrationRegistry;
pub use runtime::{ConduitRuntime, EngineConfig, RuntimeConfig};
pub use scheduler::{interval_for, Scheduler};
