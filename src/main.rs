use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};

use serp_harvest::infrastructure::{Cli, init_logging_with_config};
use serp_harvest::{AppConfig, Collaborators, ConfigManager, Orchestrator, RunOptions, print_outcome};

async fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    let config = manager.load_config().await?;
    Ok(ConfigManager::apply_overrides(config, &cli.to_overrides())?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("serp-harvest: {e:#}");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = init_logging_with_config(&config.logging) {
        eprintln!("serp-harvest: failed to initialize logging: {e:#}");
    }

    info!(
        method = %config.scraping.scrape_method,
        search_type = %config.scraping.search_type,
        "Starting serp-harvest"
    );

    let collaborators = Collaborators::from_config(&config);
    let orchestrator = Orchestrator::new(config, collaborators, RunOptions { keep_storage_open: false });

    match orchestrator.run().await {
        Ok(outcome) => {
            if let Err(e) = print_outcome(&mut std::io::stdout().lock(), &outcome) {
                eprintln!("serp-harvest: failed to write report: {e}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "💥 Run failed");
            eprintln!("serp-harvest: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}
