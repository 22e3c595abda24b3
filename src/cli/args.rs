//! CLI argument definitions using clap derive

use crate::record::BuildResult;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// buildhist - inspect a builder's build history
///
/// Reads the record directory of one builder: finished builds, their
/// results, and the retention state of record and log files.
#[derive(Parser, Debug)]
#[command(name = "buildhist")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "BUILDHIST_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List finished builds, newest first
    List(ListArgs),

    /// Show one build
    Show(ShowArgs),

    /// Delete records and logs outside the retention horizons
    Prune(PruneArgs),

    /// Print the number the next build would get
    NextNumber(BuilderArgs),

    /// Show configuration
    Config(ConfigArgs),
}

/// Which builder directory to read
#[derive(Args, Debug, Clone)]
pub struct BuilderArgs {
    /// Builder record directory
    #[arg(short, long, default_value = ".")]
    pub dir: PathBuf,

    /// Builder name (defaults to the directory name)
    #[arg(long)]
    pub name: Option<String>,
}

impl BuilderArgs {
    pub fn builder_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.dir
                .canonicalize()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "builder".to_string())
        })
    }
}

/// Arguments for the list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    #[command(flatten)]
    pub builder: BuilderArgs,

    /// Maximum number of builds to show
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,

    /// Only builds with a stamp on this branch (repeatable)
    #[arg(short, long)]
    pub branch: Vec<String>,

    /// Only builds whose stamps all match CODEBASE=BRANCH (repeatable)
    #[arg(long, value_parser = parse_codebase)]
    pub codebase: Vec<(String, String)>,

    /// Only builds with this result (repeatable)
    #[arg(short, long)]
    pub result: Vec<BuildResult>,

    /// Project whose codebases complete --codebase selections
    #[arg(short, long)]
    pub project: Option<String>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the show command
#[derive(Parser, Debug)]
pub struct ShowArgs {
    #[command(flatten)]
    pub builder: BuilderArgs,

    /// Build number; negative counts back from the newest (-1)
    #[arg(allow_negative_numbers = true)]
    pub number: i64,

    /// Print the record as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the prune command
#[derive(Parser, Debug)]
pub struct PruneArgs {
    #[command(flatten)]
    pub builder: BuilderArgs,

    /// Build records to keep (default: from config)
    #[arg(long)]
    pub builds: Option<u64>,

    /// Build logs to keep (default: from config)
    #[arg(long)]
    pub logs: Option<u64>,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,
}

/// Output format for list command
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Parse a CODEBASE=BRANCH pair
fn parse_codebase(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid CODEBASE=BRANCH format: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}
