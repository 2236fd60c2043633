// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: Apache-2.0

//! Lacquer workflow engine CLI.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use lacquer_core::{CancellationToken, Engine, EngineConfig, FileStateStore, LLMProvider, Workflow};
use lacquer_providers::{AnthropicProvider, OpenAIProvider};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "lacquer")]
#[command(version, about = "Lacquer workflow engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition
    Validate {
        /// Path to workflow file
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Run a workflow
    Run {
        /// Path to workflow file
        #[arg(value_name = "FILE")]
        file: String,

        /// Input JSON string, or a path to a JSON file
        #[arg(short, long)]
        input: Option<String>,

        /// Directory used for persisted run state
        #[arg(long, default_value = "lacquer-state")]
        state_dir: String,

        /// Number of completed steps between snapshots (disabled if unset)
        #[arg(long)]
        snapshot_interval: Option<usize>,
    },

    /// Resume a previously persisted run
    Resume {
        /// Path to workflow file
        #[arg(value_name = "FILE")]
        file: String,

        /// Run id to resume
        #[arg(long)]
        run_id: String,

        /// Snapshot id to restore instead of the latest persisted state
        #[arg(long)]
        snapshot_id: Option<String>,

        /// Directory used for persisted run state
        #[arg(long, default_value = "lacquer-state")]
        state_dir: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| format!("lacquer={}", log_level).into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Validate { file } => validate_workflow(&file),
        Commands::Run { file, input, state_dir, snapshot_interval } => {
            run_workflow(&file, input.as_deref(), &state_dir, snapshot_interval).await
        }
        Commands::Resume { file, run_id, snapshot_id, state_dir } => {
            resume_workflow(&file, &run_id, snapshot_id.as_deref(), &state_dir).await
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn load_workflow(file_path: &str) -> Result<Workflow> {
    let content = fs::read_to_string(file_path).with_context(|| format!("failed to read workflow file: {}", file_path))?;
    let workflow: Workflow =
        serde_yaml::from_str(&content).with_context(|| format!("failed to parse workflow YAML: {}", file_path))?;
    workflow.validate().with_context(|| "workflow validation failed")?;
    Ok(workflow)
}

fn validate_workflow(file_path: &str) -> Result<()> {
    println!("{} {}", "Validating workflow:".cyan().bold(), file_path);
    let workflow = load_workflow(file_path)?;

    println!("{}", "Workflow is valid".green().bold());
    if let Some(metadata) = &workflow.metadata {
        if let Some(name) = &metadata.name {
            println!("  Name: {}", name);
        }
    }
    println!("  Version: {}", workflow.version);
    println!("  Steps: {}", workflow.workflow.steps.len());

    Ok(())
}

fn registered_providers() -> HashMap<String, Arc<dyn LLMProvider>> {
    let mut providers: HashMap<String, Arc<dyn LLMProvider>> = HashMap::new();

    match OpenAIProvider::from_env() {
        Ok(provider) => {
            info!("registered OpenAI provider");
            providers.insert("openai".to_string(), Arc::new(provider));
        }
        Err(_) => info!("OpenAI provider not available (OPENAI_API_KEY not set)"),
    }

    match AnthropicProvider::from_env() {
        Ok(provider) => {
            info!("registered Anthropic provider");
            providers.insert("anthropic".to_string(), Arc::new(provider));
        }
        Err(_) => info!("Anthropic provider not available (ANTHROPIC_API_KEY not set)"),
    }

    providers
}

fn build_engine(state_dir: &str, snapshot_interval: Option<usize>) -> Engine {
    let mut config = EngineConfig::in_memory()
        .with_state_store(Arc::new(FileStateStore::new(state_dir, 20)))
        .with_snapshot_interval(snapshot_interval);

    for (name, provider) in registered_providers() {
        config = config.with_llm_provider(name, provider);
    }

    Engine::new(config)
}

async fn run_workflow(file_path: &str, input: Option<&str>, state_dir: &str, snapshot_interval: Option<usize>) -> Result<()> {
    println!("{} {}", "Running workflow:".cyan().bold(), file_path);
    let workflow = load_workflow(file_path)?;

    let inputs = match input {
        Some(raw) => parse_input(raw)?,
        None => HashMap::new(),
    };

    let engine = build_engine(state_dir, snapshot_interval);

    println!("{}", "Executing workflow...".cyan());
    let summary = engine
        .execute_workflow(workflow, inputs)
        .await
        .with_context(|| "workflow execution failed")?;

    print_summary(&summary);
    Ok(())
}

async fn resume_workflow(file_path: &str, run_id: &str, snapshot_id: Option<&str>, state_dir: &str) -> Result<()> {
    println!("{} {} ({})", "Resuming workflow:".cyan().bold(), file_path, run_id);
    let workflow = load_workflow(file_path)?;

    let engine = build_engine(state_dir, None);

    // Restoring here confirms persisted state (and, for a snapshot id, the
    // step cursor) exists for this run before we hand off to the executor.
    let restored = engine
        .restore_run(workflow.clone(), run_id, snapshot_id)
        .with_context(|| "failed to restore run")?;
    println!("  Restored state: {}", serde_json::to_string(&restored.get_state_map().to_json()).unwrap_or_default());

    let cancel = CancellationToken::new();
    let summary = engine
        .execute_workflow_with_run_id(
            workflow,
            HashMap::new(),
            Some(run_id.to_string()),
            snapshot_id.map(str::to_string),
            cancel,
        )
        .await
        .with_context(|| "workflow execution failed")?;

    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &lacquer_core::ExecutionSummary) {
    println!("{}", "Run complete".green().bold());
    println!("  Run id: {}", summary.run_id);
    println!("  Status: {:?}", summary.status);
    println!(
        "  Tokens: {} prompt / {} completion",
        summary.token_usage.prompt_tokens, summary.token_usage.completion_tokens
    );
    println!("\n{}", "Outputs:".cyan().bold());
    println!("{}", serde_json::to_string_pretty(&summary.outputs).unwrap_or_else(|_| format!("{:?}", summary.outputs)));
}

fn parse_input(input_str: &str) -> Result<HashMap<String, Value>> {
    if Path::new(input_str).exists() {
        let content = fs::read_to_string(input_str).with_context(|| format!("failed to read input file: {}", input_str))?;
        serde_json::from_str(&content).with_context(|| format!("failed to parse input JSON from file: {}", input_str))
    } else {
        serde_json::from_str(input_str).with_context(|| "failed to parse input JSON string")
    }
}
