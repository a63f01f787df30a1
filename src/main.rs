// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::filter::EnvFilter;

use cli::{Cli, Commands};
use norn_config::Config;
use norn_core::{Scheduler, Task, TaskPayload, TaskStatus, TaskType};
use norn_model::ModelProvider;
use norn_tools::ToolRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Subcommands that need no model wiring come first.
    match &cli.command {
        Commands::ListProviders { json } => {
            return list_providers(*json);
        }
        Commands::ShowConfig => {
            let config = norn_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            return Ok(());
        }
        _ => {}
    }

    let config = norn_config::load(cli.config.as_deref())?;
    let scheduler = build_scheduler(&config, cli.model.as_deref())?;

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.gateway.bind.clone());
            scheduler.start();
            norn_gateway::serve(&bind, scheduler).await
        }
        Commands::Run { goal, task_type } => run_once(scheduler, goal, &task_type).await,
        Commands::ListProviders { .. } | Commands::ShowConfig => unreachable!(),
    }
}

/// Wire config → model driver → tool catalogue → scheduler.
fn build_scheduler(config: &Config, model_override: Option<&str>) -> anyhow::Result<Scheduler> {
    let model_cfg = match model_override {
        Some(s) => norn_model::resolve_model_from_config(config, s),
        None => config.model.clone(),
    };
    let model: Arc<dyn ModelProvider> =
        Arc::from(norn_model::from_config(&model_cfg).context("constructing model driver")?);
    let mut tools = ToolRegistry::with_builtins();
    if let Some(enabled) = &config.tools.enabled {
        tools.retain_named(enabled);
    }
    Ok(Scheduler::new(
        model,
        Arc::new(tools),
        config.scheduler.max_concurrent_tasks,
    ))
}

/// One-shot mode: submit a single task, wait for it, print the result.
async fn run_once(scheduler: Scheduler, goal: String, task_type: &str) -> anyhow::Result<()> {
    let task_type = match task_type.to_lowercase().as_str() {
        "planning" => TaskType::Planning,
        "reasoning" => TaskType::Reasoning,
        other => bail!("unsupported task type {other:?}; use \"planning\" or \"reasoning\""),
    };

    scheduler.start();
    let id = scheduler
        .submit(Task::new("cli", TaskPayload::prompt(goal), task_type))
        .context("submitting task")?;

    let snapshot = scheduler
        .wait_until_terminal(id)
        .await
        .context("task vanished from the scheduler")?;
    scheduler.shutdown().await;

    let result = snapshot.result.unwrap_or_default();
    match snapshot.status {
        TaskStatus::Completed => {
            println!("{result}");
            Ok(())
        }
        TaskStatus::Failed => bail!("task failed: {result}"),
        other => bail!("task ended in {other:?}"),
    }
}

fn list_providers(json: bool) -> anyhow::Result<()> {
    let drivers = norn_model::list_drivers();
    if json {
        let entries: Vec<serde_json::Value> = drivers
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id,
                    "label": d.label,
                    "base_url": d.default_base_url,
                    "api_key_env": d.default_api_key_env,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for d in drivers {
        let url = d.default_base_url.unwrap_or("-");
        let key = d.default_api_key_env.unwrap_or("-");
        println!("{:<12} {:<20} {:<45} {key}", d.id, d.label, url);
    }
    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
