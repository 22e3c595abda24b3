//! Next-number command - print the number the next build would get

use super::open_builder;
use crate::cli::args::BuilderArgs;
use crate::config::Config;
use crate::error::BuildhistResult;

/// Execute the next-number command
pub async fn execute(args: BuilderArgs, config: &Config) -> BuildhistResult<()> {
    let status = open_builder(&args, config).await?;
    println!("{}", status.next_build_number());
    Ok(())
}
