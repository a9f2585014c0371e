//! Command handlers for the `docklens` binary

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::error;

use super::{ContainersArgs, InitArgs, PurgeArgs, QueryArgs, StatsArgs, WatchArgs};
use crate::config::{generate_sample_config, Config};
use crate::core::SemanticIndex;
use crate::ingest::{ContainerWatcher, WatcherHandle};
use crate::rag::Retriever;
use crate::runtime::{ContainerRuntime, DockerCli};
use crate::service::{DockLens, QueryOptions, QueryResponse, QUERY_SUGGESTIONS};

fn open_index(config: &Config) -> Result<Arc<SemanticIndex>> {
    let path = config.index.resolved_path();
    let index = SemanticIndex::open(&path)
        .with_context(|| format!("Failed to open index: {}", path.display()))?;
    Ok(Arc::new(index))
}

fn runtime(config: &Config) -> Arc<dyn ContainerRuntime> {
    Arc::new(DockerCli::new(&config.runtime.docker_bin))
}

fn build_service(config: &Config, index: Arc<SemanticIndex>) -> DockLens {
    let retriever = Retriever::new(
        Arc::clone(&index),
        config.embedding.build(),
        config.rerank.build(),
        config.retrieval.options(),
    );
    DockLens::new(index, runtime(config), retriever, config.completion.build())
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg} [{elapsed_precise}]") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(80));
    pb.set_message(message.to_string());
    pb
}

/// Run the watcher until Ctrl-C or the event feed ends
pub async fn watch(config: &Config, args: &WatchArgs) -> Result<()> {
    let index = open_index(config)?;
    let watcher = ContainerWatcher::new(
        runtime(config),
        config.embedding.build(),
        Arc::clone(&index),
        config.chunking.streamer_config(),
    );

    let handle = WatcherHandle::start(watcher)
        .await
        .context("Failed to start container watcher")?;
    let monitor = handle.monitor();

    println!(
        "\n{} Watching {} container(s), index: {}",
        "🔎".bright_cyan(),
        monitor.get_watcher_stats().active_count.to_string().bright_white(),
        config.index.resolved_path().display()
    );
    println!("{}", "Press Ctrl-C to stop.".dimmed());

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut elapsed = 0u64;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                println!("\n{} Stopping, flushing buffers...", "⏹".yellow());
                break;
            }
            _ = ticker.tick() => {
                if handle.is_finished() {
                    break;
                }
                elapsed += 1;
                if args.stats_interval > 0 && elapsed % args.stats_interval == 0 {
                    let stats = monitor.get_watcher_stats();
                    let streamers = monitor.get_active_streamers();
                    let lines: usize = streamers.values().map(|s| s.lines_processed).sum();
                    let chunks: usize = streamers.values().map(|s| s.chunks_created).sum();
                    println!(
                        "{} {} active, {} lines, {} chunks, {} indexed total, up {}",
                        "•".cyan(),
                        stats.active_count,
                        lines,
                        chunks,
                        index.len(),
                        humantime::format_duration(Duration::from_secs(stats.runtime_seconds as u64))
                    );
                }
            }
        }
    }

    handle.stop().await?;
    println!("{} Watcher stopped", "✓".bright_green());
    Ok(())
}

/// Answer one question; exits non-zero with a generic message on failure
pub async fn query(config: &Config, args: &QueryArgs) -> Result<()> {
    let service = build_service(config, open_index(config)?);
    let options = QueryOptions {
        k: args.k,
        use_reranking: args.no_rerank.then_some(false),
        level: args.level,
    };

    let pb = (!args.json).then(|| spinner("Searching logs..."));
    let result = service
        .query_with(&args.container, &args.question, &options)
        .await;
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Query failed");
            eprintln!("{} {}", "✗".red(), e.user_message().red());
            std::process::exit(1);
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_answer(&response);
    }
    Ok(())
}

fn print_answer(response: &QueryResponse) {
    println!("\n{}\n", response.answer);

    if response.references.is_empty() {
        return;
    }

    println!("{}", "References".bold());
    for r in &response.references {
        let level = match r.log_level.as_str() {
            "error" => r.log_level.as_str().red(),
            "warn" => r.log_level.as_str().yellow(),
            other => other.normal(),
        };
        let score = r
            .rerank_score
            .map(|s| format!(" relevance {s:.3}"))
            .unwrap_or_default();
        println!(
            "  [{}] {} {} {}{}",
            r.id,
            r.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            level,
            r.container_name.cyan(),
            score.dimmed()
        );
        println!("      {}", r.text_preview.replace('\n', " "));
    }
}

pub fn stats(config: &Config, args: &StatsArgs) -> Result<()> {
    let service = build_service(config, open_index(config)?);
    let stats = service.retrieval_stats();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let index = &stats.index;
    println!("{}", "Index".bold());
    println!("  chunks:     {}", index.total_chunks.to_string().bright_white());
    println!(
        "  dimension:  {}",
        index.dimension.map_or("-".to_string(), |d| d.to_string())
    );
    println!(
        "  updated:    {}",
        index
            .updated_at
            .map_or("never".to_string(), |t| t.to_rfc3339())
    );

    if !index.per_container.is_empty() {
        println!("{}", "Per container".bold());
        for (id, count) in &index.per_container {
            let short: String = id.chars().take(12).collect();
            println!("  {short}  {count}");
        }
    }
    if !index.per_level.is_empty() {
        println!("{}", "Per level".bold());
        for (level, count) in &index.per_level {
            println!("  {:<6} {}", level.as_str(), count);
        }
    }

    let r = &stats.retrieval;
    println!("{}", "Retrieval".bold());
    println!(
        "  initial_k {}, final_k {}, rerank {}, completion {}",
        r.initial_k,
        r.final_k,
        if r.use_reranking && stats.reranker_configured { "on" } else { "off" },
        stats.completion_model
    );
    Ok(())
}

pub async fn purge(config: &Config, args: &PurgeArgs) -> Result<()> {
    let service = build_service(config, open_index(config)?);
    let removed = service.purge(&args.container).await?;
    println!(
        "{} Removed {} chunk(s) for {}",
        "✓".bright_green(),
        removed.to_string().bright_white(),
        args.container
    );
    Ok(())
}

pub async fn containers(config: &Config, args: &ContainersArgs) -> Result<()> {
    let service = build_service(config, open_index(config)?);
    let containers = service.list_containers(args.all).await?;
    let indexed = service.index().stats().per_container;

    if containers.is_empty() {
        println!("{}", "No containers found.".dimmed());
        return Ok(());
    }

    println!(
        "{:<14} {:<24} {:<10} {:<8} {}",
        "ID".bold(),
        "NAME".bold(),
        "STATUS".bold(),
        "CHUNKS".bold(),
        "IMAGE".bold()
    );
    for c in &containers {
        let status = if c.is_running() {
            c.status.as_str().green()
        } else {
            c.status.as_str().dimmed()
        };
        println!(
            "{:<14} {:<24} {:<10} {:<8} {}",
            c.short_id(),
            c.name,
            status,
            indexed.get(&c.id).copied().unwrap_or(0),
            c.image
        );
    }
    Ok(())
}

pub fn suggestions() {
    println!("{}", "Try asking:".bold());
    for s in QUERY_SUGGESTIONS {
        println!("  {} {}", "•".cyan(), s);
    }
}

pub fn init(args: &InitArgs) -> Result<()> {
    let path = args.path.clone().unwrap_or_else(Config::default_path);
    write_sample(&path, args.force)?;
    println!("{} Wrote {}", "✓".bright_green(), path.display());
    Ok(())
}

fn write_sample(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, generate_sample_config())
        .with_context(|| format!("Failed to write config: {}", path.display()))
}
