//! Prune command - apply retention horizons to a builder directory

use super::open_builder;
use crate::cli::args::PruneArgs;
use crate::config::Config;
use crate::error::BuildhistResult;
use console::style;

/// Execute the prune command
pub async fn execute(args: PruneArgs, config: &Config) -> BuildhistResult<()> {
    let status = open_builder(&args.builder, config).await?;

    let mut horizons = status.horizons();
    if args.builds.is_some() {
        horizons.builds = args.builds;
    }
    if args.logs.is_some() {
        horizons.logs = args.logs;
    }
    if horizons.builds.is_none() && horizons.logs.is_none() {
        println!(
            "{} No retention horizons configured for {}",
            style("!").yellow(),
            status.name()
        );
        return Ok(());
    }
    status.set_horizons(horizons);

    let report = status.prune(false).await;
    for path in &report.deleted {
        println!("  {} {}", style("-").red(), path.display());
    }
    println!(
        "{} Pruned {} file(s) from {}",
        style("✓").green(),
        report.deleted.len(),
        status.name()
    );
    Ok(())
}
