// Dossier CLI
// Command line entry point for entity research runs

mod commands;
mod logging;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use dossier_service::EngineConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dossier")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run dependency-aware research workers against an entity", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(global = true, short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(global = true, long = "log-json")]
    log_json: bool,

    /// Engine configuration file (YAML)
    #[arg(global = true, long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Research an entity with the built-in workers
    Run(commands::run::RunArgs),

    /// Show the execution layers without calling any provider
    Plan(commands::plan::PlanArgs),

    /// List registered workers
    Workers,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_json);

    let config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => commands::run::execute(args, config).await,
        Commands::Plan(args) => commands::plan::execute(args, &config),
        Commands::Workers => commands::workers::execute(&config),
    }
}
