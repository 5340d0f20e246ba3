use crate::predicate::Predicate;
use crate::WorkflowError;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub type WorkflowId = String;
pub type ActionId = String;

/// Complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: WorkflowId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub trigger: TriggerSpec,
    pub actions: HashMap<ActionId, WorkflowAction>,
    pub start_action_id: ActionId,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Workflow {
    pub fn new(
        id: impl Into<String>,
        trigger: TriggerSpec,
        start_action_id: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            trigger,
            actions: HashMap::new(),
            start_action_id: start_action_id.into(),
            enabled: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_action(mut self, id: impl Into<String>, action: WorkflowAction) -> Self {
        self.add_action(id, action);
        self
    }

    pub fn add_action(&mut self, id: impl Into<String>, action: WorkflowAction) {
        self.actions.insert(id.into(), action);
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn find_action(&self, id: &str) -> Option<&WorkflowAction> {
        self.actions.get(id)
    }

    /// Check that every referenced action exists and that the action graph
    /// has no cycles.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.id.trim().is_empty() {
            return Err(WorkflowError::Invalid("workflow id is empty".to_string()));
        }
        if !self.actions.contains_key(&self.start_action_id) {
            return Err(WorkflowError::StartActionNotFound(self.start_action_id.clone()));
        }

        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();
        for id in self.actions.keys() {
            index.insert(id.as_str(), graph.add_node(id.as_str()));
        }

        for (id, action) in &self.actions {
            for target in action.targets() {
                let to = index.get(target.as_str()).ok_or_else(|| {
                    WorkflowError::UnknownActionReference {
                        from: id.clone(),
                        to: target.clone(),
                    }
                })?;
                graph.add_edge(index[id.as_str()], *to, ());
            }
        }

        toposort(&graph, None)
            .map(|_| ())
            .map_err(|cycle| WorkflowError::CyclicDependency(graph[cycle.node_id()].to_string()))
    }
}

/// What fires a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    Event {
        #[serde(rename = "eventPattern")]
        event_pattern: String,
    },
    Schedule {
        #[serde(rename = "cronExpression")]
        cron_expression: String,
    },
    Webhook {
        #[serde(rename = "webhookPath")]
        webhook_path: String,
    },
    Manual,
}

impl TriggerSpec {
    pub fn event(pattern: impl Into<String>) -> Self {
        TriggerSpec::Event {
            event_pattern: pattern.into(),
        }
    }

    pub fn schedule(expression: impl Into<String>) -> Self {
        TriggerSpec::Schedule {
            cron_expression: expression.into(),
        }
    }
}

/// One step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawAction", into = "RawAction")]
pub struct WorkflowAction {
    pub kind: ActionKind,
    pub on_success: Option<ActionId>,
    pub on_failure: Option<ActionId>,
    /// Extra attempts after the first failure
    pub retries: u32,
    pub timeout_ms: Option<u64>,
}

impl WorkflowAction {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            on_success: None,
            on_failure: None,
            retries: 0,
            timeout_ms: None,
        }
    }

    pub fn on_success(mut self, next: impl Into<String>) -> Self {
        self.on_success = Some(next.into());
        self
    }

    pub fn on_failure(mut self, next: impl Into<String>) -> Self {
        self.on_failure = Some(next.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn action_type(&self) -> ActionType {
        self.kind.action_type()
    }

    /// Every action id this action can hand control to.
    pub fn targets(&self) -> Vec<&ActionId> {
        let mut targets: Vec<&ActionId> = Vec::new();
        targets.extend(self.on_success.iter());
        targets.extend(self.on_failure.iter());
        match &self.kind {
            ActionKind::Condition(c) => {
                targets.extend(c.true_branch.iter());
                targets.extend(c.false_branch.iter());
            }
            ActionKind::Parallel(p) => targets.extend(p.actions.iter()),
            ActionKind::Foreach(f) => targets.push(&f.action_id),
            _ => {}
        }
        targets
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    HttpRequest,
    IntegrationCall,
    Condition,
    Transform,
    Delay,
    Parallel,
    Foreach,
}

impl ActionType {
    pub const ALL: [ActionType; 7] = [
        ActionType::HttpRequest,
        ActionType::IntegrationCall,
        ActionType::Condition,
        ActionType::Transform,
        ActionType::Delay,
        ActionType::Parallel,
        ActionType::Foreach,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::HttpRequest => "http_request",
            ActionType::IntegrationCall => "integration_call",
            ActionType::Condition => "condition",
            ActionType::Transform => "transform",
            ActionType::Delay => "delay",
            ActionType::Parallel => "parallel",
            ActionType::Foreach => "foreach",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ActionType::HttpRequest => "Issue an HTTP request with templated URL and body",
            ActionType::IntegrationCall => "Invoke a named method on a registered integration",
            ActionType::Condition => "Branch on a predicate over the run context",
            ActionType::Transform => "Render a template into a variable",
            ActionType::Delay => "Pause the run without blocking others",
            ActionType::Parallel => "Run several actions concurrently",
            ActionType::Foreach => "Run an action once per item of an array",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum ActionKind {
    HttpRequest(HttpRequestConfig),
    IntegrationCall(IntegrationCallConfig),
    Condition(ConditionConfig),
    Transform(TransformConfig),
    Delay(DelayConfig),
    Parallel(ParallelConfig),
    Foreach(ForeachConfig),
}

impl ActionKind {
    pub fn action_type(&self) -> ActionType {
        match self {
            ActionKind::HttpRequest(_) => ActionType::HttpRequest,
            ActionKind::IntegrationCall(_) => ActionType::IntegrationCall,
            ActionKind::Condition(_) => ActionType::Condition,
            ActionKind::Transform(_) => ActionType::Transform,
            ActionKind::Delay(_) => ActionType::Delay,
            ActionKind::Parallel(_) => ActionType::Parallel,
            ActionKind::Foreach(_) => ActionType::Foreach,
        }
    }

    fn from_parts(action_type: ActionType, config: Value) -> Result<Self, serde_json::Error> {
        Ok(match action_type {
            ActionType::HttpRequest => ActionKind::HttpRequest(serde_json::from_value(config)?),
            ActionType::IntegrationCall => {
                ActionKind::IntegrationCall(serde_json::from_value(config)?)
            }
            ActionType::Condition => ActionKind::Condition(serde_json::from_value(config)?),
            ActionType::Transform => ActionKind::Transform(serde_json::from_value(config)?),
            ActionType::Delay => ActionKind::Delay(serde_json::from_value(config)?),
            ActionType::Parallel => ActionKind::Parallel(serde_json::from_value(config)?),
            ActionType::Foreach => ActionKind::Foreach(serde_json::from_value(config)?),
        })
    }

    fn config_value(&self) -> Value {
        let result = match self {
            ActionKind::HttpRequest(c) => serde_json::to_value(c),
            ActionKind::IntegrationCall(c) => serde_json::to_value(c),
            ActionKind::Condition(c) => serde_json::to_value(c),
            ActionKind::Transform(c) => serde_json::to_value(c),
            ActionKind::Delay(c) => serde_json::to_value(c),
            ActionKind::Parallel(c) => serde_json::to_value(c),
            ActionKind::Foreach(c) => serde_json::to_value(c),
        };
        result.unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestConfig {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_result_as: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationCallConfig {
    pub integration_id: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_result_as: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionConfig {
    pub condition: Predicate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_branch: Option<ActionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub false_branch: Option<ActionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformConfig {
    /// A `{{path}}` template string, or a JSON value whose strings are templates
    pub template: Value,
    pub store_result_as: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayConfig {
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelConfig {
    pub actions: Vec<ActionId>,
    #[serde(default = "default_enabled")]
    pub wait_for_all: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_result_as: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeachConfig {
    pub items_path: String,
    #[serde(default = "default_item_alias")]
    pub item_alias: String,
    pub action_id: ActionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_result_as: Option<String>,
}

fn default_item_alias() -> String {
    "item".to_string()
}

/// Wire shape: `{type, config, onSuccess?, onFailure?, retries?, timeoutMs?}`
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAction {
    #[serde(rename = "type")]
    action_type: ActionType,
    #[serde(default)]
    config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    on_success: Option<ActionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    on_failure: Option<ActionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
}

impl TryFrom<RawAction> for WorkflowAction {
    type Error = String;

    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        let kind = ActionKind::from_parts(raw.action_type, raw.config)
            .map_err(|e| format!("invalid {} config: {}", raw.action_type, e))?;
        Ok(Self {
            kind,
            on_success: raw.on_success,
            on_failure: raw.on_failure,
            retries: raw.retries.unwrap_or(0),
            timeout_ms: raw.timeout_ms,
        })
    }
}

impl From<WorkflowAction> for RawAction {
    fn from(action: WorkflowAction) -> Self {
        Self {
            action_type: action.kind.action_type(),
            config: action.kind.config_value(),
            on_success: action.on_success,
            on_failure: action.on_failure,
            retries: (action.retries > 0).then_some(action.retries),
            timeout_ms: action.timeout_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delay(ms: u64) -> WorkflowAction {
        WorkflowAction::new(ActionKind::Delay(DelayConfig { duration_ms: ms }))
    }

    #[test]
    fn parses_wire_definition() {
        let wf: Workflow = serde_json::from_value(json!({
            "id": "enroll-sync",
            "trigger": { "type": "event", "eventPattern": "enrollment.created" },
            "startActionId": "lookup",
            "actions": {
                "lookup": {
                    "type": "integration_call",
                    "config": {
                        "integrationId": "sis",
                        "method": "findUser",
                        "args": ["{{trigger.userId}}"],
                        "storeResultAs": "user"
                    },
                    "onSuccess": "wait",
                    "retries": 2,
                    "timeoutMs": 5000
                },
                "wait": { "type": "delay", "config": { "durationMs": 10 } }
            }
        }))
        .unwrap();

        assert!(wf.enabled);
        assert_eq!(wf.trigger, TriggerSpec::event("enrollment.created"));
        let lookup = wf.find_action("lookup").unwrap();
        assert_eq!(lookup.action_type(), ActionType::IntegrationCall);
        assert_eq!(lookup.retries, 2);
        assert_eq!(lookup.timeout_ms, Some(5000));
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn rejects_bad_config_for_type() {
        let err = serde_json::from_value::<WorkflowAction>(json!({
            "type": "delay",
            "config": { "seconds": 3 }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("invalid delay config"));
    }

    #[test]
    fn validate_reports_dangling_reference() {
        let wf = Workflow::new("wf", TriggerSpec::Manual, "a")
            .with_action("a", delay(1).on_success("missing"));
        assert_eq!(
            wf.validate(),
            Err(WorkflowError::UnknownActionReference {
                from: "a".to_string(),
                to: "missing".to_string()
            })
        );
    }

    #[test]
    fn validate_rejects_cycles() {
        let wf = Workflow::new("wf", TriggerSpec::Manual, "a")
            .with_action("a", delay(1).on_success("b"))
            .with_action("b", delay(1).on_failure("a"));
        assert!(matches!(wf.validate(), Err(WorkflowError::CyclicDependency(_))));
    }

    #[test]
    fn validate_requires_start_action() {
        let wf = Workflow::new("wf", TriggerSpec::Manual, "nope").with_action("a", delay(1));
        assert_eq!(
            wf.validate(),
            Err(WorkflowError::StartActionNotFound("nope".to_string()))
        );
    }

    #[test]
    fn round_trips_through_wire_shape() {
        let action = delay(25).on_success("next").with_retries(1);
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "delay");
        assert_eq!(json["config"]["durationMs"], 25);
        assert_eq!(json["onSuccess"], "next");
        assert_eq!(json["retries"], 1);
    }
}
