use crate::registry::IntegrationRegistry;
use crate::runtime::EngineConfig;
use crate::store::RunStore;
use conduitcore::template::{bare_path, interpolate, render_value, resolve_path};
use conduitcore::{
    ActionError, ActionFailure, ActionId, ActionKind, ForeachConfig, LogLevel, ParallelConfig,
    RetryExecutor, RetryOptions, RunContext, RunId, Workflow, WorkflowAction,
};
use conduithttp::{Method, RateLimitedClient, RequestOptions};
use futures::future::{join_all, try_join_all, BoxFuture};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Where a run goes after an action succeeds.
enum Next {
    OnSuccess,
    /// Chosen by a condition; `None` ends the chain
    Branch(Option<ActionId>),
}

struct Step {
    context: RunContext,
    value: Value,
    next: Next,
}

impl Step {
    fn store(context: RunContext, name: Option<&str>, value: Value) -> Self {
        let context = match name {
            Some(name) => context.with_variable(name, value.clone()),
            None => context,
        };
        Self {
            context,
            value,
            next: Next::OnSuccess,
        }
    }
}

/// Walks a workflow's action graph for one run.
pub(crate) struct ActionExecutor {
    registry: Arc<IntegrationRegistry>,
    http: Arc<RateLimitedClient>,
    runs: Arc<RunStore>,
    config: EngineConfig,
    retry: RetryExecutor,
}

impl ActionExecutor {
    pub fn new(
        registry: Arc<IntegrationRegistry>,
        http: Arc<RateLimitedClient>,
        runs: Arc<RunStore>,
        config: EngineConfig,
    ) -> Self {
        let retry = RetryExecutor::new(
            RetryOptions::no_retry()
                .with_initial_backoff(config.action_retry_backoff())
                .retry_all_statuses(),
        );
        Self {
            registry,
            http,
            runs,
            config,
            retry,
        }
    }

    /// Execute `action_id` and everything it leads to.
    ///
    /// A failure anywhere downstream is caught by the nearest `onFailure`
    /// on the way back up; only an uncaught failure is returned.
    pub fn execute_chain<'a>(
        &'a self,
        workflow: &'a Workflow,
        run_id: RunId,
        action_id: &'a str,
        context: RunContext,
    ) -> BoxFuture<'a, Result<(RunContext, Value), ActionFailure>> {
        Box::pin(async move {
            let action = workflow.find_action(action_id).ok_or_else(|| {
                ActionFailure::new(action_id, ActionError::ActionNotFound(action_id.to_string()))
            })?;
            let context = context.at_action(action_id);
            let entry = context.clone();

            match self.execute_step(workflow, run_id, action_id, action, context).await {
                Ok(done) => Ok(done),
                Err(failure) => match &action.on_failure {
                    Some(recovery) => {
                        tracing::warn!(
                            "Action '{}' failed, recovering with '{}': {}",
                            action_id,
                            recovery,
                            failure
                        );
                        self.runs.log(
                            &run_id,
                            LogLevel::Warn,
                            Some(action_id),
                            format!("Recovering with '{}'", recovery),
                        );
                        let context = entry.with_variable(
                            "error",
                            json!({
                                "actionId": failure.action_id,
                                "message": failure.error.to_string(),
                            }),
                        );
                        self.execute_chain(workflow, run_id, recovery, context).await
                    }
                    None => Err(failure),
                },
            }
        })
    }

    async fn execute_step(
        &self,
        workflow: &Workflow,
        run_id: RunId,
        action_id: &str,
        action: &WorkflowAction,
        context: RunContext,
    ) -> Result<(RunContext, Value), ActionFailure> {
        let started = Instant::now();
        tracing::info!("Run {} executing '{}' ({})", run_id, action_id, action.action_type());
        self.runs.log(
            &run_id,
            LogLevel::Info,
            Some(action_id),
            format!("Started {} action", action.action_type()),
        );

        let step = match self.run_with_policy(workflow, run_id, action_id, action, context).await {
            Ok(step) => step,
            Err(error) => {
                tracing::error!("Action {} failed: {}", action_id, error);
                self.runs.log(&run_id, LogLevel::Error, Some(action_id), error.to_string());
                return Err(ActionFailure::new(action_id, error));
            }
        };

        let duration_ms = started.elapsed().as_millis();
        tracing::info!("Action {} completed in {}ms", action_id, duration_ms);
        self.runs.log(
            &run_id,
            LogLevel::Info,
            Some(action_id),
            format!("Completed in {}ms", duration_ms),
        );
        self.runs.set_context(&run_id, step.context.clone());

        let next = match step.next {
            Next::OnSuccess => action.on_success.clone(),
            Next::Branch(branch) => branch,
        };
        match next {
            Some(next) => self.execute_chain(workflow, run_id, &next, step.context).await,
            None => Ok((step.context, step.value)),
        }
    }

    /// One action with its timeout applied per attempt and its `retries`.
    async fn run_with_policy(
        &self,
        workflow: &Workflow,
        run_id: RunId,
        action_id: &str,
        action: &WorkflowAction,
        context: RunContext,
    ) -> Result<Step, ActionError> {
        let timeout = action
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.default_action_timeout());
        let options = self.retry.options().clone().with_max_retries(action.retries);
        let attempts = AtomicU32::new(0);

        self.retry
            .execute_with(
                || {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                    let context = context.clone();
                    async move {
                        if attempt > 0 {
                            self.runs.log(
                                &run_id,
                                LogLevel::Warn,
                                Some(action_id),
                                format!("Retry {} of {}", attempt, action.retries),
                            );
                        }
                        let attempt = self.run_action(workflow, run_id, action_id, action, context);
                        match tokio::time::timeout(timeout, attempt).await {
                            Ok(result) => result,
                            Err(_) => Err(ActionError::Timeout {
                                ms: timeout.as_millis() as u64,
                            }),
                        }
                    }
                },
                &options,
            )
            .await
    }

    async fn run_action(
        &self,
        workflow: &Workflow,
        run_id: RunId,
        action_id: &str,
        action: &WorkflowAction,
        context: RunContext,
    ) -> Result<Step, ActionError> {
        let scope = context.scope();

        match &action.kind {
            ActionKind::HttpRequest(config) => {
                let method = Method::from_bytes(config.method.to_uppercase().as_bytes())
                    .map_err(|_| {
                        ActionError::Configuration(format!(
                            "unsupported HTTP method '{}'",
                            config.method
                        ))
                    })?;
                let mut request = RequestOptions::new(method, interpolate(&config.url, &scope));
                for (name, value) in &config.headers {
                    request = request.with_header(name.clone(), interpolate(value, &scope));
                }
                if let Some(body) = &config.body {
                    request = request.with_body(render_value(body, &scope));
                }

                let response = self.http.request(request).await?;
                Ok(Step::store(context, config.store_result_as.as_deref(), response.data))
            }

            ActionKind::IntegrationCall(config) => {
                let args = config.args.iter().map(|arg| render_value(arg, &scope)).collect();
                let value = self
                    .registry
                    .call(&config.integration_id, &config.method, args)
                    .await?;
                Ok(Step::store(context, config.store_result_as.as_deref(), value))
            }

            ActionKind::Condition(config) => {
                let outcome = config.condition.evaluate(&scope).unwrap_or_else(|e| {
                    tracing::warn!(
                        "Condition '{}' could not be evaluated, taking false branch: {}",
                        action_id,
                        e
                    );
                    self.runs.log(&run_id, LogLevel::Warn, Some(action_id), e.to_string());
                    false
                });
                let branch = if outcome {
                    config.true_branch.clone()
                } else {
                    config.false_branch.clone()
                };
                self.runs.log(
                    &run_id,
                    LogLevel::Info,
                    Some(action_id),
                    format!("Condition is {}", outcome),
                );
                Ok(Step {
                    context,
                    value: Value::Bool(outcome),
                    next: Next::Branch(branch),
                })
            }

            ActionKind::Transform(config) => {
                let value = render_value(&config.template, &scope);
                Ok(Step::store(context, Some(&config.store_result_as), value))
            }

            ActionKind::Delay(config) => {
                tokio::time::sleep(Duration::from_millis(config.duration_ms)).await;
                Ok(Step::store(context, None, Value::Null))
            }

            ActionKind::Parallel(config) => {
                self.run_parallel(workflow, run_id, config, context).await
            }

            ActionKind::Foreach(config) => {
                self.run_foreach(workflow, run_id, action_id, config, context, &scope)
                    .await
            }
        }
    }

    /// Each branch gets its own copy of the context; branch variables are
    /// merged back in declaration order. With `waitForAll` the first branch
    /// to fail fails the action and the remaining branches are dropped.
    async fn run_parallel(
        &self,
        workflow: &Workflow,
        run_id: RunId,
        config: &ParallelConfig,
        context: RunContext,
    ) -> Result<Step, ActionError> {
        let branches = config
            .actions
            .iter()
            .map(|id| self.execute_chain(workflow, run_id, id, context.clone()));

        let results: Vec<Option<(RunContext, Value)>> = if config.wait_for_all {
            try_join_all(branches)
                .await
                .map_err(|failure| failure.error)?
                .into_iter()
                .map(Some)
                .collect()
        } else {
            let settled = join_all(branches).await;
            config
                .actions
                .iter()
                .zip(settled)
                .map(|(id, result)| match result {
                    Ok(done) => Some(done),
                    Err(failure) => {
                        tracing::warn!("Parallel branch '{}' failed: {}", id, failure);
                        self.runs.log(
                            &run_id,
                            LogLevel::Warn,
                            Some(id),
                            format!("Branch failed, result is null: {}", failure.error),
                        );
                        None
                    }
                })
                .collect()
        };

        let mut merged = context;
        let mut values = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Some((branch, value)) => {
                    merged = merged.merge_variables(&branch, &[]);
                    values.push(value);
                }
                None => values.push(Value::Null),
            }
        }

        let name = config.store_result_as.as_deref();
        Ok(Step::store(merged, name, Value::Array(values)))
    }

    /// Iterations run one after another, each from the parent context with
    /// the item bound to `itemAlias`. Their variables are merged back once
    /// the loop is done.
    async fn run_foreach(
        &self,
        workflow: &Workflow,
        run_id: RunId,
        action_id: &str,
        config: &ForeachConfig,
        context: RunContext,
        scope: &Value,
    ) -> Result<Step, ActionError> {
        let path = bare_path(&config.items_path);
        let items = match resolve_path(scope, path) {
            Some(Value::Array(items)) => items.clone(),
            _ => {
                return Err(ActionError::ExecutionFailed(format!(
                    "itemsPath '{}' is not an array",
                    path
                )))
            }
        };

        self.runs.log(
            &run_id,
            LogLevel::Info,
            Some(action_id),
            format!("Iterating over {} items", items.len()),
        );

        let mut children = Vec::with_capacity(items.len());
        let mut values = Vec::with_capacity(items.len());
        for item in items {
            let child = context.clone().with_variable(config.item_alias.as_str(), item);
            let (child, value) = self
                .execute_chain(workflow, run_id, &config.action_id, child)
                .await
                .map_err(|failure| failure.error)?;
            children.push(child);
            values.push(value);
        }

        let except = [config.item_alias.as_str()];
        let merged = children
            .iter()
            .fold(context, |acc, child| acc.merge_variables(child, &except));
        Ok(Step::store(merged, config.store_result_as.as_deref(), Value::Array(values)))
    }
}
