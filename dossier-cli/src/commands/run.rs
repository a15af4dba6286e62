use crate::output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use color_eyre::Result;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use dossier_service::execution::events::progress_channel;
use dossier_service::{
    builtin_registry, EngineConfig, ExecutionEvent, Orchestrator, OverallStatus, RunRequest,
    TaskStatus,
};

/// Research one entity
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Identifier of the entity to research
    pub entity_id: String,

    /// Run only these workers and their dependencies (can be repeated)
    #[arg(long = "worker", short = 'w', value_name = "WORKER")]
    pub workers: Vec<String>,

    /// Seed the run context (can be repeated, format: key=value; JSON values are parsed)
    #[arg(long = "input", short = 'i', value_name = "KEY=VALUE")]
    pub inputs: Vec<String>,

    /// Workers allowed in flight at once
    #[arg(long, short = 'c', value_name = "N")]
    pub concurrency: Option<usize>,

    /// Serve providers from a fixture file instead of the configured services
    #[arg(long, value_name = "FILE")]
    pub fixtures: Option<PathBuf>,

    /// Cancel the run after this many seconds
    #[arg(long, value_name = "SECS")]
    pub deadline: Option<u64>,

    /// Print the full result as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

fn parse_input(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        color_eyre::eyre::bail!("Invalid input format '{}'. Expected key=value", raw);
    };
    if key.is_empty() {
        color_eyre::eyre::bail!("Invalid input format '{}'. Key is empty", raw);
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

pub async fn execute(args: RunArgs, mut config: EngineConfig) -> Result<()> {
    if let Some(path) = args.fixtures {
        config.providers.fixtures = Some(path);
    }

    let mut request = RunRequest::new(args.entity_id.clone()).workers(args.workers.iter().cloned());
    for raw in &args.inputs {
        let (key, value) = parse_input(raw)?;
        request = request.input(key, value);
    }
    if let Some(limit) = args.concurrency {
        request = request.concurrency(limit);
    }
    if let Some(secs) = args.deadline {
        request = request.deadline(Duration::from_secs(secs));
    }

    let providers = config.build_providers()?;
    let registry = Arc::new(builtin_registry(&providers, &config)?);

    let (tx, mut rx) = progress_channel();
    let orchestrator = Orchestrator::new(registry)
        .with_config(config.executor_config())
        .with_progress(tx);

    // Ctrl-C cancels the run; whatever finished is still reported
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    // Spawn execution in background
    let exec_handle =
        tokio::spawn(async move { orchestrator.run_with_cancel(request, cancel).await });

    // Process events in the foreground
    while let Some(event) = rx.recv().await {
        render(&event);
    }

    let result = exec_handle.await?;

    if args.json {
        println!("{}", result.to_json()?);
    } else {
        println!("{}", result.summary);
    }

    if result.overall_status == OverallStatus::Failure {
        std::process::exit(1);
    }

    Ok(())
}

fn render(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::RunStarted {
            run_id,
            entity_id,
            total_workers,
            total_layers,
        } => {
            output::header(&format!(
                "Researching '{}' ({} workers, {} layers)",
                entity_id, total_workers, total_layers
            ));
            output::dim(&format!("  run {}", run_id));
        }

        ExecutionEvent::PlanningFailed { message, .. } => {
            output::error(&format!("planning failed: {}", message));
        }

        ExecutionEvent::LayerStarted { index, workers } => {
            output::layer_header(*index, workers);
        }

        ExecutionEvent::LayerSettled { index, duration } => {
            output::dim(&format!(
                "  Layer {} settled ({:.2}s)",
                index,
                duration.as_secs_f64()
            ));
        }

        ExecutionEvent::WorkerStarted {
            worker_name,
            attempt,
        } => {
            if *attempt == 1 {
                output::status("Running", worker_name);
            } else {
                output::status("Retrying", &format!("{} (attempt {})", worker_name, attempt));
            }
        }

        ExecutionEvent::WorkerRetrying {
            worker_name,
            attempt,
            error,
            delay,
        } => {
            output::warning(&format!(
                "{} attempt {} failed: {} (next in {:.2}s)",
                worker_name,
                attempt,
                error,
                delay.as_secs_f64()
            ));
        }

        ExecutionEvent::WorkerCompleted {
            worker_name,
            status,
            attempts,
            duration,
            error,
        } => {
            let line = format!(
                "    {} {} after {} attempt(s) ({:.2}s)",
                worker_name,
                status,
                attempts,
                duration.as_secs_f64()
            );
            if *status == TaskStatus::Succeeded {
                output::dim_success(&line);
            } else {
                output::dim_failure(&line);
                if let Some(error) = error {
                    output::dim_failure(&format!("      {}", error));
                }
            }
        }

        ExecutionEvent::WorkerSkipped {
            worker_name,
            reason,
        } => {
            output::warning(&format!("{} skipped: {}", worker_name, reason));
        }

        ExecutionEvent::RunCancelled { .. } => {
            output::warning("run cancelled");
        }

        ExecutionEvent::RunCompleted {
            status, duration, ..
        } => {
            let line = format!("Run finished: {} ({:.2}s)", status, duration.as_secs_f64());
            match status {
                OverallStatus::Success => output::success(&line),
                OverallStatus::PartialSuccess => output::warning(&line),
                OverallStatus::Failure => output::failure(&line),
            }
        }
    }
}
