//! CLI command implementations

pub mod config;
pub mod list;
pub mod next_number;
pub mod prune;
pub mod show;

pub use config::execute as config;
pub use list::execute as list;
pub use next_number::execute as next_number;
pub use prune::execute as prune;
pub use show::execute as show;

use crate::builder::BuilderStatus;
use crate::cli::args::BuilderArgs;
use crate::config::Config;
use crate::error::{BuildhistError, BuildhistResult};
use std::sync::Arc;

/// Open the builder directory named on the command line
async fn open_builder(args: &BuilderArgs, config: &Config) -> BuildhistResult<Arc<BuilderStatus>> {
    if !args.dir.is_dir() {
        return Err(BuildhistError::BuilderDirNotFound(args.dir.clone()));
    }
    BuilderStatus::open(args.builder_name(), &args.dir, config).await
}
