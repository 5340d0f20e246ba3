use crate::executor::ActionExecutor;
use crate::registry::IntegrationRegistry;
use crate::runtime::EngineConfig;
use crate::scheduler::{interval_for, Scheduler};
use crate::store::RunStore;
use conduitcore::{
    EventBus, HandlerError, IntegrationEvent, RunContext, RunId, Subscription, TriggerSpec,
    Workflow, WorkflowError, WorkflowId, WorkflowRun, WILDCARD,
};
use conduithttp::{HttpClientConfig, RateLimitedClient};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Integration id carried by the engine's own lifecycle events.
pub const ENGINE_INTEGRATION_ID: &str = "workflow-engine";

pub const WORKFLOW_STARTED: &str = "workflow.started";
pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
pub const WORKFLOW_FAILED: &str = "workflow.failed";

/// How many lifecycle events deep one workflow may trigger another.
const MAX_TRIGGER_DEPTH: u64 = 5;

struct EngineInner {
    config: EngineConfig,
    bus: EventBus,
    registry: Arc<IntegrationRegistry>,
    executor: ActionExecutor,
    runs: Arc<RunStore>,
    workflows: RwLock<HashMap<WorkflowId, Arc<Workflow>>>,
    subscriptions: Mutex<HashMap<WorkflowId, Subscription>>,
    scheduler: Scheduler,
}

/// Registers declarative workflows, wires their triggers, and runs them.
///
/// Runs execute in the background; [`trigger_workflow`](Self::trigger_workflow)
/// returns as soon as the run is recorded. Cloning shares the engine.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(
        bus: EventBus,
        registry: Arc<IntegrationRegistry>,
        config: EngineConfig,
    ) -> conduitcore::Result<Self> {
        let http = RateLimitedClient::new(
            HttpClientConfig::default()
                .with_rate_limit(config.http_rate_limit_per_minute)
                .with_timeout_ms(config.http_timeout_ms),
        )?;
        let runs = Arc::new(RunStore::new(config.max_retained_runs));
        let executor =
            ActionExecutor::new(registry.clone(), Arc::new(http), runs.clone(), config.clone());

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                bus,
                registry,
                executor,
                runs,
                workflows: RwLock::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                scheduler: Scheduler::new(),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn registry(&self) -> &Arc<IntegrationRegistry> {
        &self.inner.registry
    }

    /// Validate and store a workflow, wiring its trigger if enabled.
    /// Re-registering an id replaces the previous definition.
    pub fn register_workflow(&self, workflow: Workflow) -> Result<(), WorkflowError> {
        workflow.validate()?;

        let id = workflow.id.clone();
        self.unwire(&id);
        let workflow = Arc::new(workflow);
        self.inner.workflows.write().insert(id.clone(), workflow.clone());
        if workflow.enabled {
            self.wire(&workflow);
        }

        tracing::info!(
            "Registered workflow '{}' with {} actions (enabled: {})",
            id,
            workflow.actions.len(),
            workflow.enabled
        );
        Ok(())
    }

    pub fn unregister_workflow(&self, workflow_id: &str) -> bool {
        self.unwire(workflow_id);
        let removed = self.inner.workflows.write().remove(workflow_id).is_some();
        if removed {
            tracing::info!("Unregistered workflow '{}'", workflow_id);
        }
        removed
    }

    /// Enable or disable a workflow, arming or cancelling its trigger.
    pub fn set_enabled(&self, workflow_id: &str, enabled: bool) -> Result<(), WorkflowError> {
        let updated = {
            let mut workflows = self.inner.workflows.write();
            let current = workflows
                .get(workflow_id)
                .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
            if current.enabled == enabled {
                return Ok(());
            }
            let mut updated = Workflow::clone(current);
            updated.enabled = enabled;
            let updated = Arc::new(updated);
            workflows.insert(workflow_id.to_string(), updated.clone());
            updated
        };

        self.unwire(workflow_id);
        if enabled {
            self.wire(&updated);
        }
        let state = if enabled { "enabled" } else { "disabled" };
        tracing::info!("Workflow '{}' {}", workflow_id, state);
        Ok(())
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Option<Workflow> {
        self.inner
            .workflows
            .read()
            .get(workflow_id)
            .map(|wf| Workflow::clone(wf))
    }

    pub fn list_workflows(&self) -> Vec<Workflow> {
        let mut workflows: Vec<Workflow> = self
            .inner
            .workflows
            .read()
            .values()
            .map(|wf| Workflow::clone(wf))
            .collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        workflows
    }

    /// Start a run and return it immediately. The action graph is walked
    /// in a background task; failures are recorded on the run and
    /// announced on the bus, never returned here.
    pub async fn trigger_workflow(
        &self,
        workflow_id: &str,
        triggered_by: &str,
        data: Value,
    ) -> Result<WorkflowRun, WorkflowError> {
        self.start_run(workflow_id, triggered_by, data, 0).await
    }

    /// `depth` counts the lifecycle events between this run and one that
    /// was not triggered by another workflow.
    async fn start_run(
        &self,
        workflow_id: &str,
        triggered_by: &str,
        data: Value,
        depth: u64,
    ) -> Result<WorkflowRun, WorkflowError> {
        let workflow = self
            .inner
            .workflows
            .read()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
        if !workflow.enabled {
            return Err(WorkflowError::Disabled(workflow_id.to_string()));
        }

        let run = WorkflowRun::new(workflow_id, triggered_by, data);
        let run_id = run.id;
        self.inner.runs.insert(run.clone());
        tracing::info!("Starting run {} of '{}' ({})", run_id, workflow_id, triggered_by);

        self.inner
            .bus
            .publish(
                ENGINE_INTEGRATION_ID,
                WORKFLOW_STARTED,
                json!({
                    "workflowId": workflow_id,
                    "runId": run_id,
                    "triggeredBy": triggered_by,
                    "triggerDepth": depth,
                }),
            )
            .await;

        let engine = self.clone();
        let context = run.context.clone();
        tokio::spawn(async move {
            engine.execute_run(workflow, run_id, context, depth).await;
        });

        Ok(run)
    }

    async fn execute_run(
        &self,
        workflow: Arc<Workflow>,
        run_id: RunId,
        context: RunContext,
        depth: u64,
    ) {
        let result = self
            .inner
            .executor
            .execute_chain(&workflow, run_id, &workflow.start_action_id, context)
            .await;

        match result {
            Ok((context, _)) => {
                self.inner.runs.complete(&run_id, context);
                tracing::info!("Run {} of '{}' completed", run_id, workflow.id);
                self.inner
                    .bus
                    .publish(
                        ENGINE_INTEGRATION_ID,
                        WORKFLOW_COMPLETED,
                        json!({
                            "workflowId": workflow.id,
                            "runId": run_id,
                            "triggerDepth": depth,
                        }),
                    )
                    .await;
            }
            Err(failure) => {
                let message = failure.error.to_string();
                self.inner.runs.fail(&run_id, &failure.action_id, message.clone());
                tracing::error!("Run {} of '{}' failed: {}", run_id, workflow.id, failure);
                self.inner
                    .bus
                    .publish(
                        ENGINE_INTEGRATION_ID,
                        WORKFLOW_FAILED,
                        json!({
                            "workflowId": workflow.id,
                            "runId": run_id,
                            "actionId": failure.action_id,
                            "error": message,
                            "triggerDepth": depth,
                        }),
                    )
                    .await;
            }
        }
    }

    pub fn get_run(&self, run_id: &RunId) -> Option<WorkflowRun> {
        self.inner.runs.get(run_id)
    }

    pub fn list_runs(&self, workflow_id: Option<&str>) -> Vec<WorkflowRun> {
        self.inner.runs.list(workflow_id)
    }

    /// Wait until a run leaves `running`. `None` if the run is unknown.
    pub async fn wait_for_run(&self, run_id: &RunId) -> Option<WorkflowRun> {
        let mut finished = self.inner.runs.subscribe(run_id)?;
        // An error means the run was evicted mid-wait
        finished.wait_for(|done| *done).await.ok()?;
        self.inner.runs.get(run_id)
    }

    /// Cancel every timer and event subscription. Runs already in flight
    /// are left to finish.
    pub fn shutdown(&self) {
        self.inner.scheduler.disarm_all();
        let subscriptions: Vec<Subscription> = self
            .inner
            .subscriptions
            .lock()
            .drain()
            .map(|(_, sub)| sub)
            .collect();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        tracing::info!("Workflow engine shut down");
    }

    fn wire(&self, workflow: &Workflow) {
        match &workflow.trigger {
            TriggerSpec::Event { event_pattern } => self.wire_event(&workflow.id, event_pattern),
            TriggerSpec::Schedule { cron_expression } => match interval_for(cron_expression) {
                Some(period) => {
                    let weak = Arc::downgrade(&self.inner);
                    let workflow_id = workflow.id.clone();
                    self.inner.scheduler.arm(workflow.id.clone(), period, move || {
                        let weak = weak.clone();
                        let workflow_id = workflow_id.clone();
                        async move {
                            let Some(engine) = upgrade(&weak) else { return };
                            let data = json!({ "scheduledAt": chrono::Utc::now() });
                            let triggered = engine.trigger_workflow(&workflow_id, "schedule", data);
                            if let Err(e) = triggered.await {
                                tracing::warn!(
                                    "Scheduled trigger of '{}' failed: {}",
                                    workflow_id,
                                    e
                                );
                            }
                        }
                    });
                    tracing::info!("Scheduled '{}' {}", workflow.id, cron_expression);
                }
                None => tracing::warn!(
                    "Unsupported schedule '{}' for '{}', not scheduling",
                    cron_expression,
                    workflow.id
                ),
            },
            TriggerSpec::Webhook { .. } | TriggerSpec::Manual => {}
        }
    }

    fn wire_event(&self, workflow_id: &str, pattern: &str) {
        let weak = Arc::downgrade(&self.inner);
        let id = workflow_id.to_string();
        let matcher = EventPattern::parse(pattern);
        let subscribe_to = matcher.subscription_key();

        let subscription = self.inner.bus.subscribe(subscribe_to, move |event: IntegrationEvent| {
            let weak = weak.clone();
            let id = id.clone();
            let matcher = matcher.clone();
            async move {
                if !matcher.accepts(&event, &id) {
                    return Ok(());
                }
                let depth = trigger_depth(&event);
                if depth > MAX_TRIGGER_DEPTH {
                    tracing::warn!(
                        "Not triggering '{}' from '{}': lifecycle chain deeper than {}",
                        id,
                        event.event_type,
                        MAX_TRIGGER_DEPTH
                    );
                    return Ok(());
                }
                let Some(engine) = upgrade(&weak) else {
                    return Ok(());
                };
                let triggered_by = format!("event:{}", event.event_type);
                engine
                    .start_run(&id, &triggered_by, event.payload, depth)
                    .await
                    .map(|_| ())
                    .map_err(|e| HandlerError(e.to_string()))
            }
        });

        tracing::info!("Workflow '{}' listening for '{}'", workflow_id, pattern);
        self.inner
            .subscriptions
            .lock()
            .insert(workflow_id.to_string(), subscription);
    }

    fn unwire(&self, workflow_id: &str) {
        self.inner.scheduler.disarm(workflow_id);
        let subscription = self.inner.subscriptions.lock().remove(workflow_id);
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
    }
}

/// Depth of a run started by `event`: one past the run that published it
/// for engine lifecycle events, zero for anything else.
fn trigger_depth(event: &IntegrationEvent) -> u64 {
    if event.integration_id != ENGINE_INTEGRATION_ID {
        return 0;
    }
    event
        .payload
        .get("triggerDepth")
        .and_then(Value::as_u64)
        .unwrap_or(0)
        + 1
}

fn upgrade(weak: &Weak<EngineInner>) -> Option<WorkflowEngine> {
    weak.upgrade().map(|inner| WorkflowEngine { inner })
}

/// Literal type, `*`, or a `prefix.*` family.
#[derive(Debug, Clone, PartialEq)]
enum EventPattern {
    Exact(String),
    Any,
    Prefix(String),
}

impl EventPattern {
    fn parse(pattern: &str) -> Self {
        if pattern == WILDCARD {
            EventPattern::Any
        } else if let Some(prefix) = pattern.strip_suffix(".*") {
            EventPattern::Prefix(format!("{}.", prefix))
        } else {
            EventPattern::Exact(pattern.to_string())
        }
    }

    fn subscription_key(&self) -> String {
        match self {
            EventPattern::Exact(event_type) => event_type.clone(),
            EventPattern::Any | EventPattern::Prefix(_) => WILDCARD.to_string(),
        }
    }

    /// Whether `event` should start `workflow_id`. A workflow never
    /// reacts to its own lifecycle events, and `*` ignores the engine's.
    fn accepts(&self, event: &IntegrationEvent, workflow_id: &str) -> bool {
        if event.integration_id == ENGINE_INTEGRATION_ID {
            if matches!(self, EventPattern::Any) {
                return false;
            }
            if event.payload.get("workflowId").and_then(Value::as_str) == Some(workflow_id) {
                return false;
            }
        }
        match self {
            EventPattern::Exact(event_type) => &event.event_type == event_type,
            EventPattern::Any => true,
            EventPattern::Prefix(prefix) => event.event_type.starts_with(prefix.as_str()),
        }
    }
}
