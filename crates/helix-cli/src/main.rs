//! helix-pool CLI - accelerator scheduling for inference workloads

use anyhow::Result;
use clap::Parser;
use helix_cli::{Cli, Commands};
use helix_telemetry::LogLevel;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = helix_cli::load_config(cli.config.as_ref())?;

    let mut log = config.log.clone();
    if cli.verbose > 0 {
        log.level = LogLevel::from_verbosity(cli.verbose);
    }
    helix_telemetry::init_logging(&log)?;

    match cli.command {
        Commands::Run { jobs, models, fast, metrics } => {
            helix_cli::commands::run::execute(config, jobs, &models, fast, metrics).await
        }
        Commands::Status { json } => helix_cli::commands::status::execute(&config, json),
        Commands::CheckConfig { strict } => {
            helix_cli::commands::check_config::execute(&config, strict)
        }
    }
}
