use std::time::Duration;
use thiserror::Error;

/// Implemented by errors that may carry an HTTP status code.
///
/// The retry executor consults this to decide whether a failure is
/// eligible for another attempt.
pub trait RetryableError {
    fn status_code(&self) -> Option<u16> {
        None
    }

    /// Errors that no amount of retrying will fix.
    fn is_permanent(&self) -> bool {
        false
    }
}

#[derive(Error, Debug)]
pub enum ConduitError {
    #[error("Integration error: {0}")]
    Integration(#[from] IntegrationError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Action error: {0}")]
    Action(#[from] ActionFailure),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Raised by a circuit breaker that is rejecting calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Circuit breaker '{name}' is open, retry in {}ms", retry_after.as_millis())]
pub struct CircuitOpenError {
    pub name: String,
    pub retry_after: Duration,
}

#[derive(Error, Debug, Clone)]
pub enum IntegrationError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("Unknown integration: {0}")]
    UnknownIntegration(String),

    #[error("Unknown method '{method}' on integration '{integration}'")]
    UnknownMethod { integration: String, method: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Failed(String),
}

impl IntegrationError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            IntegrationError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, IntegrationError::CircuitOpen(_))
    }
}

impl RetryableError for IntegrationError {
    fn status_code(&self) -> Option<u16> {
        IntegrationError::status_code(self)
    }

    fn is_permanent(&self) -> bool {
        matches!(
            self,
            IntegrationError::Cancelled
                | IntegrationError::CircuitOpen(_)
                | IntegrationError::UnknownIntegration(_)
                | IntegrationError::UnknownMethod { .. }
                | IntegrationError::Configuration(_)
        )
    }
}

/// Failure reported by an event handler. Never surfaces to the publisher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        HandlerError(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        HandlerError(s.to_string())
    }
}

impl From<IntegrationError> for HandlerError {
    fn from(e: IntegrationError) -> Self {
        HandlerError(e.to_string())
    }
}

impl RetryableError for HandlerError {}

#[derive(Error, Debug, Clone)]
pub enum ActionError {
    #[error("Missing config: {0}")]
    MissingConfig(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    ExecutionFailed(String),

    #[error(transparent)]
    Integration(#[from] IntegrationError),

    #[error("Action timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Action not found: {0}")]
    ActionNotFound(String),
}

impl RetryableError for ActionError {
    fn status_code(&self) -> Option<u16> {
        match self {
            ActionError::Integration(e) => e.status_code(),
            _ => None,
        }
    }

    fn is_permanent(&self) -> bool {
        match self {
            ActionError::Integration(e) => e.is_permanent(),
            ActionError::MissingConfig(_)
            | ActionError::Configuration(_)
            | ActionError::ActionNotFound(_) => true,
            ActionError::ExecutionFailed(_) | ActionError::Timeout { .. } => false,
        }
    }
}

/// An action failure tagged with the id of the action that raised it.
#[derive(Error, Debug, Clone)]
#[error("Action '{action_id}' failed: {error}")]
pub struct ActionFailure {
    pub action_id: String,
    #[source]
    pub error: ActionError,
}

impl ActionFailure {
    pub fn new(action_id: impl Into<String>, error: ActionError) -> Self {
        Self {
            action_id: action_id.into(),
            error,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Workflow is disabled: {0}")]
    Disabled(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Cyclic action graph detected at '{0}'")]
    CyclicDependency(String),

    #[error("Action '{from}' references unknown action '{to}'")]
    UnknownActionReference { from: String, to: String },

    #[error("Start action not found: {0}")]
    StartActionNotFound(String),
}
