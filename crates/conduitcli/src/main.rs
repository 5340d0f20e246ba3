// crates/conduitcli/src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use conduitcore::{
    ActionKind, ActionType, ConditionConfig, HttpRequestConfig, LogLevel, Operator, Predicate,
    RunStatus, TransformConfig, TriggerSpec, Workflow, WorkflowAction,
};
use conduitruntime::{ConduitRuntime, RuntimeConfig, WORKFLOW_STARTED};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "conduit")]
#[command(about = "Conduit integration workflow CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a workflow file and trigger it once
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Trigger data as JSON string
        #[arg(short, long)]
        input: Option<String>,

        /// Runtime configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available action types
    Actions,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            config,
            verbose,
        } => {
            let fallback = if verbose { "debug" } else { "info" };
            fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
                )
                .init();

            run_workflow(file, input, config).await?;
        }

        Commands::Validate { file } => {
            validate_workflow(&file)?;
        }

        Commands::Actions => {
            list_actions();
        }

        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(())
}

fn load_workflow(file: &Path) -> Result<Workflow> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading workflow {}", file.display()))?;
    let workflow: Workflow = serde_json::from_str(&raw)
        .with_context(|| format!("parsing workflow {}", file.display()))?;
    Ok(workflow)
}

async fn run_workflow(file: PathBuf, input: Option<String>, config: Option<PathBuf>) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());
    let workflow = load_workflow(&file)?;
    let workflow_id = workflow.id.clone();

    println!("📋 Workflow: {}", workflow.name);
    println!("   Actions: {}", workflow.actions.len());
    println!("   Start: {}", workflow.start_action_id);
    println!();

    let data: Value = match input {
        Some(raw) => {
            let data: Value = serde_json::from_str(&raw).context("parsing --input")?;
            if !data.is_object() {
                bail!("Input must be a JSON object");
            }
            data
        }
        None => json!({}),
    };

    let config = match config {
        Some(path) => RuntimeConfig::from_file(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    tracing::debug!("Runtime config: {:?}", config);
    let runtime = ConduitRuntime::with_config(config)?;
    let engine = runtime.engine();

    // Stream every bus event while the run is in flight
    runtime.bus().subscribe_all(|event| async move {
        if event.event_type == WORKFLOW_STARTED {
            println!("▶️  Workflow started");
        } else {
            println!(
                "  📨 {} from {}: {}",
                event.event_type, event.integration_id, event.payload
            );
        }
        Ok(())
    });

    engine.register_workflow(workflow)?;
    let run = engine.trigger_workflow(&workflow_id, "manual", data).await?;
    let run = engine
        .wait_for_run(&run.id)
        .await
        .context("run disappeared before it finished")?;

    println!();
    for log in &run.logs {
        let icon = match log.level {
            LogLevel::Info => "ℹ️ ",
            LogLevel::Warn => "⚠️ ",
            LogLevel::Error => "❌",
        };
        match &log.action_id {
            Some(action_id) => println!("  {} [{}] {}", icon, action_id, log.message),
            None => println!("  {} {}", icon, log.message),
        }
    }

    println!();
    println!("📊 Run Summary:");
    println!("   Run ID: {}", run.id);
    println!("   Status: {}", run.status);
    if let Some(completed_at) = run.completed_at {
        let elapsed = completed_at - run.started_at;
        println!("   Duration: {}ms", elapsed.num_milliseconds());
    }

    match run.status {
        RunStatus::Completed => {
            println!("✨ Workflow completed successfully");
            if !run.context.variables.is_empty() {
                println!();
                println!("📤 Variables:");
                for (name, value) in &run.context.variables {
                    println!("   {}: {}", name, value);
                }
            }
        }
        _ => {
            println!(
                "💥 Workflow failed at {}: {}",
                run.failed_action_id.as_deref().unwrap_or("?"),
                run.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    runtime.shutdown();
    Ok(())
}

fn validate_workflow(file: &Path) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = load_workflow(file)?;
    workflow.validate()?;

    println!("✅ Workflow is valid:");
    println!("   ID: {}", workflow.id);
    println!("   Name: {}", workflow.name);
    println!("   Trigger: {}", describe_trigger(&workflow.trigger));
    println!("   Actions: {}", workflow.actions.len());

    Ok(())
}

fn describe_trigger(trigger: &TriggerSpec) -> String {
    match trigger {
        TriggerSpec::Event { event_pattern } => format!("event {}", event_pattern),
        TriggerSpec::Schedule { cron_expression } => format!("schedule {}", cron_expression),
        TriggerSpec::Webhook { .. } => "webhook".to_string(),
        TriggerSpec::Manual => "manual".to_string(),
    }
}

fn list_actions() {
    println!("📦 Available Action Types:");
    println!();

    for action_type in ActionType::ALL {
        println!("  • {}", action_type);
        println!("    {}", action_type.description());
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let fetch = WorkflowAction::new(ActionKind::HttpRequest(HttpRequestConfig {
        method: "GET".to_string(),
        url: "{{trigger.url}}".to_string(),
        headers: HashMap::new(),
        body: None,
        store_result_as: Some("response".to_string()),
    }))
    .with_retries(2)
    .with_timeout_ms(10_000)
    .on_success("check")
    .on_failure("report");

    let check = WorkflowAction::new(ActionKind::Condition(ConditionConfig {
        condition: Predicate::compare("response", Operator::Exists, Value::Null),
        true_branch: Some("summarize".to_string()),
        false_branch: Some("report".to_string()),
    }));

    let summarize = WorkflowAction::new(ActionKind::Transform(TransformConfig {
        template: json!({ "source": "{{trigger.url}}", "body": "{{response}}" }),
        store_result_as: "summary".to_string(),
    }));

    let report = WorkflowAction::new(ActionKind::Transform(TransformConfig {
        template: json!("Fetching {{trigger.url}} failed: {{error.message}}"),
        store_result_as: "failure".to_string(),
    }));

    let mut workflow = Workflow::new("example-fetch", TriggerSpec::Manual, "fetch")
        .with_name("Example HTTP Workflow")
        .with_action("fetch", fetch)
        .with_action("check", check)
        .with_action("summarize", summarize)
        .with_action("report", report);
    workflow.description = Some("Fetches a URL and summarizes the response".to_string());
    workflow.validate()?;

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  conduit run --file {} --input '{{\"url\": \"https://api.github.com/zen\"}}'",
        output.display()
    );

    Ok(())
}
