//! DockLens - live container log search with retrieval-augmented answers
//!
//! Watches running containers, indexes their logs as they arrive and
//! answers questions about them from the command line.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use docklens::cli::{commands, Cli, Commands};
use docklens::Config;

fn init_logging(cli: &Cli, config: &Config) -> Result<()> {
    let level = if cli.verbose {
        "debug"
    } else {
        config.general.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("docklens={level}")))?;

    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry.with(fmt::layer().json().with_current_span(false)).init();
    } else {
        registry
            .with(fmt::layer().with_target(false).compact().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // `init` must work even when the existing config is broken
    if let Commands::Init(args) = &cli.command {
        return commands::init(args);
    }

    let config = Config::resolve(cli.config.as_deref())?;
    init_logging(&cli, &config)?;
    config.validate()?;

    match &cli.command {
        Commands::Watch(args) => commands::watch(&config, args).await?,
        Commands::Query(args) => commands::query(&config, args).await?,
        Commands::Stats(args) => commands::stats(&config, args)?,
        Commands::Purge(args) => commands::purge(&config, args).await?,
        Commands::Containers(args) => commands::containers(&config, args).await?,
        Commands::Suggestions => commands::suggestions(),
        Commands::Init(args) => commands::init(args)?,
    }

    Ok(())
}
