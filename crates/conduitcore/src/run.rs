use crate::workflow::{ActionId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type RunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// State threaded through a run. Updates return a new context with a
/// bumped version rather than mutating in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    pub trigger: Value,
    pub variables: Map<String, Value>,
    pub current_action_id: Option<ActionId>,
    pub version: u64,
}

impl RunContext {
    pub fn new(trigger: Value) -> Self {
        Self {
            trigger,
            variables: Map::new(),
            current_action_id: None,
            version: 0,
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self.version += 1;
        self
    }

    pub fn at_action(mut self, action_id: impl Into<String>) -> Self {
        self.current_action_id = Some(action_id.into());
        self.version += 1;
        self
    }

    /// Fold another context's variables into this one, skipping `except`.
    pub fn merge_variables(mut self, other: &RunContext, except: &[&str]) -> Self {
        let mut changed = false;
        for (k, v) in &other.variables {
            if except.contains(&k.as_str()) {
                continue;
            }
            if self.variables.get(k) != Some(v) {
                self.variables.insert(k.clone(), v.clone());
                changed = true;
            }
        }
        if changed {
            self.version += 1;
        }
        self
    }

    /// Flattened view used for templates and predicates:
    /// every variable at the top level, plus `trigger`.
    pub fn scope(&self) -> Value {
        let mut scope = self.variables.clone();
        scope.insert("trigger".to_string(), self.trigger.clone());
        Value::Object(scope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<ActionId>,
    pub message: String,
}

/// One execution of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    pub triggered_by: String,
    pub status: RunStatus,
    pub context: RunContext,
    pub logs: Vec<RunLog>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_action_id: Option<ActionId>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(
        workflow_id: impl Into<String>,
        triggered_by: impl Into<String>,
        trigger: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            triggered_by: triggered_by.into(),
            status: RunStatus::Running,
            context: RunContext::new(trigger),
            logs: Vec::new(),
            error: None,
            failed_action_id: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn log(&mut self, level: LogLevel, action_id: Option<&str>, message: impl Into<String>) {
        self.logs.push(RunLog {
            timestamp: Utc::now(),
            level,
            action_id: action_id.map(str::to_string),
            message: message.into(),
        });
    }

    pub fn complete(&mut self, context: RunContext) {
        self.context = context;
        self.status = RunStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, action_id: &str, error: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.failed_action_id = Some(action_id.to_string());
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    /// Ids of actions that logged entries, in order, without repeats.
    pub fn visited_actions(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for entry in &self.logs {
            if let Some(id) = entry.action_id.as_deref() {
                if !seen.contains(&id) {
                    seen.push(id);
                }
            }
        }
        seen
    }
}
