use anyhow::{Context, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use hotlist::app::App;
use hotlist::config::Config;
use hotlist::source::{ListOptions, ServiceError};
use hotlist::storage::{SearchFilter, SortField, SortOrder, DEFAULT_LATEST, DEFAULT_PAGE_SIZE};

#[derive(Parser, Debug)]
#[command(name = "hotlist", about = "Trending-list aggregator with cached reads and deduplicated history")]
struct Args {
    /// Configuration file (missing file means defaults)
    #[arg(long, short, default_value = "hotlist.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered sources
    Sources,
    /// Fetch one source's list and print it as JSON
    Get {
        source: String,
        /// Adapter parameter as key=value (repeatable)
        #[arg(long = "param", short = 'p', value_parser = parse_param)]
        params: Vec<(String, String)>,
        /// Bypass the response cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Run the scheduler until Ctrl-C
    Run,
    /// Refresh one source, or every enabled source, right now
    Trigger { source: Option<String> },
    /// Show per-source run configuration
    Configs,
    Enable { source: String },
    Disable { source: String },
    /// Change a source's refresh interval
    Interval { source: String, minutes: i64 },
    /// Show scheduler status
    Status,
    /// Search persisted items
    History {
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        keyword: Option<String>,
        /// Lower bound: Unix milliseconds or RFC 3339
        #[arg(long, value_parser = parse_time)]
        from: Option<i64>,
        /// Upper bound: Unix milliseconds or RFC 3339
        #[arg(long, value_parser = parse_time)]
        to: Option<i64>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        limit: u32,
        /// timestamp, title or created_at
        #[arg(long, default_value = "timestamp")]
        sort: SortField,
        /// asc or desc
        #[arg(long, default_value = "desc")]
        order: SortOrder,
    },
    /// Newest persisted items
    Latest {
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = DEFAULT_LATEST)]
        limit: usize,
    },
    /// Persisted item counts per source
    Stats,
    /// Sources with persisted items
    HistorySources,
    /// Delete cache entries by key prefix
    CacheClear { prefix: String },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    ListOptions::parse_pair(raw)
}

fn parse_time(raw: &str) -> Result<i64, String> {
    if let Ok(millis) = raw.trim().parse::<i64>() {
        return Ok(millis);
    }
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| format!("expected Unix milliseconds or RFC 3339: {e}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to encode output")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hotlist=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config '{}'", args.config.display()))?;
    tracing::debug!(config = ?config, "Effective configuration");

    let app = App::build(config).await?;

    match args.command {
        Command::Sources => {
            let descriptors: Vec<_> = app.service.registry().descriptors().collect();
            print_json(&descriptors)?;
        }
        Command::Get {
            source,
            params,
            no_cache,
        } => {
            let options: ListOptions = params.into_iter().collect();
            match app.service.get_list(&source, &options, no_cache).await {
                Ok(result) => print_json(&result)?,
                Err(ServiceError::NotFound(name)) => {
                    eprintln!("Error: source '{name}' not found. Run `hotlist sources` to list them.");
                    std::process::exit(2);
                }
            }
        }
        Command::Run => {
            app.initialize_configs().await?;
            if app.config.scheduler.auto_start {
                app.scheduler.start().await?;
            } else {
                tracing::info!("Scheduler auto-start disabled, waiting for Ctrl-C");
            }
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            app.scheduler.stop().await?;
        }
        Command::Trigger { source } => {
            app.initialize_configs().await?;
            let report = app.scheduler.trigger(source.as_deref()).await?;
            print_json(&report)?;
        }
        Command::Configs => {
            app.initialize_configs().await?;
            print_json(&app.db.all_configs().await?)?;
        }
        Command::Enable { source } => {
            app.initialize_configs().await?;
            app.db.set_enabled(&source, true).await?;
            println!("Enabled {source}");
        }
        Command::Disable { source } => {
            app.initialize_configs().await?;
            app.db.set_enabled(&source, false).await?;
            println!("Disabled {source}");
        }
        Command::Interval { source, minutes } => {
            app.initialize_configs().await?;
            app.db.set_interval(&source, minutes).await?;
            println!("Interval for {source} set to {minutes} minutes");
        }
        Command::Status => {
            print_json(&app.scheduler.status().await)?;
        }
        Command::History {
            source,
            keyword,
            from,
            to,
            page,
            limit,
            sort,
            order,
        } => {
            let filter = SearchFilter {
                source,
                keyword,
                start_millis: from,
                end_millis: to,
                page,
                limit,
                sort,
                order,
            };
            print_json(&app.db.search(&filter).await?)?;
        }
        Command::Latest { source, limit } => {
            print_json(&app.db.latest(source.as_deref(), limit).await?)?;
        }
        Command::Stats => {
            print_json(&app.db.stats().await?)?;
        }
        Command::HistorySources => {
            print_json(&app.db.list_sources().await?)?;
        }
        Command::CacheClear { prefix } => {
            let removed = app.cache.delete_by_prefix(&prefix).await;
            println!("Removed {removed} cache entries");
        }
    }

    Ok(())
}
