//! CLI module - Command line interface definitions and handlers

pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::core::LogLevel;

/// DockLens - ask questions about your containers' logs
///
/// Follows the logs of every running container, indexes them as they
/// arrive and answers natural-language questions from the index.
#[derive(Parser, Debug)]
#[command(name = "docklens")]
#[command(author = "Ryan Cashmoney <tunclon@proton.me>")]
#[command(version)]
#[command(about = "🔎 Live container log search with retrieval-augmented answers", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (default: platform config dir)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch running containers and index their logs until Ctrl-C
    Watch(WatchArgs),

    /// Ask a question about one container's logs
    Query(QueryArgs),

    /// Show index statistics
    Stats(StatsArgs),

    /// Remove every indexed chunk of a container
    Purge(PurgeArgs),

    /// List containers known to the runtime
    Containers(ContainersArgs),

    /// Print starter questions
    Suggestions,

    /// Write a commented sample config file
    Init(InitArgs),
}

#[derive(Debug, Clone, Parser)]
pub struct WatchArgs {
    /// Seconds between status lines (0 = quiet)
    #[arg(long, default_value = "60")]
    pub stats_interval: u64,
}

#[derive(Debug, Clone, Parser)]
pub struct QueryArgs {
    /// Container id
    #[arg(required = true)]
    pub container: String,

    /// Question in plain language
    #[arg(required = true)]
    pub question: String,

    /// Number of log chunks to use (default: retrieval.final_k)
    #[arg(long, short)]
    pub k: Option<usize>,

    /// Skip the rerank stage
    #[arg(long)]
    pub no_rerank: bool,

    /// Only consider chunks of this level
    #[arg(long, short)]
    pub level: Option<LogLevel>,

    /// Print the full response as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Parser)]
pub struct StatsArgs {
    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Parser)]
pub struct PurgeArgs {
    /// Container id
    #[arg(required = true)]
    pub container: String,
}

#[derive(Debug, Clone, Parser)]
pub struct ContainersArgs {
    /// Include stopped containers
    #[arg(long, short)]
    pub all: bool,
}

#[derive(Debug, Clone, Parser)]
pub struct InitArgs {
    /// Destination (default: platform config path)
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}
