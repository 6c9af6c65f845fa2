//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// jobcache - content-addressed compile job cache
///
/// Deduplicates identical compile jobs, serves repeats from a local or
/// remote cache, and schedules the rest on a worker pool.
#[derive(Parser, Debug)]
#[command(name = "jobcache")]
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
    #[arg(short, long, global = true, env = "JOBCACHE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a synthetic workload through the cache and print statistics
    Simulate(SimulateArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the simulate command. Unset values come from `[simulate]`.
#[derive(Parser, Debug, Default)]
pub struct SimulateArgs {
    /// Number of jobs to submit
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Number of distinct inputs the jobs are drawn from
    #[arg(short, long)]
    pub distinct: Option<usize>,

    /// Worker threads
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Most jobs a worker pulls at once
    #[arg(short, long)]
    pub batch: Option<usize>,

    /// Fraction of distinct inputs pre-seeded in the remote cache (0.0-1.0)
    #[arg(long, default_value_t = 0.0, value_parser = parse_fraction)]
    pub remote_hit_rate: f64,

    /// Answer remote lookups asynchronously
    #[arg(long)]
    pub async_remote: bool,

    /// Execute every job and compare outputs instead of deduplicating
    #[arg(long)]
    pub validate: bool,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
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

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    #[default]
    Table,
    /// JSON output
    Json,
}

fn parse_fraction(s: &str) -> Result<f64, String> {
    let value: f64 = s.parse().map_err(|_| format!("'{s}' is not a number"))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{value} is not between 0.0 and 1.0"))
    }
}
