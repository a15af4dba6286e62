use crate::output;

use clap::Args;
use color_eyre::Result;
use dossier_service::{EngineConfig, ExecutionPlan};

use super::catalog_registry;

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Restrict the plan to these workers and their dependencies
    #[arg(long = "worker", short = 'w', value_name = "WORKER")]
    pub workers: Vec<String>,
}

pub fn execute(args: PlanArgs, config: &EngineConfig) -> Result<()> {
    let registry = catalog_registry(config)?;
    let plan = ExecutionPlan::build(&registry, &args.workers)?;

    output::header(&format!(
        "{} workers in {} layers",
        plan.worker_count(),
        plan.layers().len()
    ));
    for (index, layer) in plan.layers().iter().enumerate() {
        output::layer_header(index, layer);
    }

    Ok(())
}
