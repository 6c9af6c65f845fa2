//! jobcache - compile job cache
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use jobcache::cli::{Cli, Commands};
use jobcache::config::ConfigManager;
use jobcache::error::JobCacheResult;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> JobCacheResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    // 0 = warn, 1 = info, 2+ = debug; `general.verbose` counts as one level
    let level = cli.verbose.saturating_add(u8::from(config.general.verbose));
    let filter = match level {
        0 => EnvFilter::new("jobcache=warn"),
        1 => EnvFilter::new("jobcache=info"),
        _ => EnvFilter::new("jobcache=debug"),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr);
    if config.general.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Commands::Simulate(args) => jobcache::cli::commands::simulate(args, &config).await,
        Commands::Config(args) => {
            jobcache::cli::commands::config(args, &config, &config_manager).await
        }
    }
}
