//! buildhist - builder history inspector
//!
//! CLI entry point that dispatches to subcommands.

use buildhist::cli::{Cli, Commands};
use buildhist::config::ConfigManager;
use buildhist::error::BuildhistResult;
use clap::Parser;
use console::style;
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

async fn run() -> BuildhistResult<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_manager = if let Some(ref path) = cli.config {
        ConfigManager::with_path(path.clone())
    } else {
        ConfigManager::new()
    };
    let config = config_manager.load().await?;

    // Initialize logging: 0 = warn, 1 = info, 2+ = debug
    let filter = match cli.verbose {
        0 => EnvFilter::new("buildhist=warn"),
        1 => EnvFilter::new("buildhist=info"),
        _ => EnvFilter::new("buildhist=debug"),
    };

    if config.general.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .with_writer(std::io::stderr)
            .init();
    }

    // Dispatch to command
    match cli.command {
        Commands::List(args) => buildhist::cli::commands::list(args, &config).await,
        Commands::Show(args) => buildhist::cli::commands::show(args, &config).await,
        Commands::Prune(args) => buildhist::cli::commands::prune(args, &config).await,
        Commands::NextNumber(args) => buildhist::cli::commands::next_number(args, &config).await,
        Commands::Config(args) => {
            buildhist::cli::commands::config(args, &config, &config_manager).await
        }
    }
}
