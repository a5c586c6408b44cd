use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feedgate::Workspace;
use feedgate_cache::{ContentGovernor, QuotaUsage};

#[derive(Parser)]
#[command(name = "feedgate")]
#[command(about = "Maintenance tool for the feedgate content cache", long_about = None)]
struct Cli {
    /// Data directory holding the session file (default: platform data dir)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Config file (default: <data-dir>/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Debug logging for the cache and quota ledger
    #[arg(short, long)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show cache occupancy and counters
    Stats,

    /// List cached keys
    Keys,

    /// Remove expired and corrupt entries, then enforce size budgets
    Cleanup,

    /// Remove one key, or every key starting with it
    Invalidate {
        key: String,

        /// Treat the key as a prefix
        #[arg(long)]
        prefix: bool,
    },

    /// Remove all cached content (quota counters are kept)
    Clear,

    /// Show quota usage for one provider or all known providers
    Quota {
        provider: Option<String>,
    },

    /// Reset a provider's quota counters
    QuotaReset {
        provider: String,
    },

    /// Run cleanup periodically until Ctrl-C
    Maintain {
        /// Seconds between cleanup passes (default: config cleanup interval)
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.verbose {
        "feedgate=debug,feedgate_cache=debug"
    } else {
        "feedgate=info,feedgate_cache=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir = cli.data_dir.clone().unwrap_or_else(Workspace::default_data_dir);

    match cli.command {
        Commands::Stats => {
            let workspace = Workspace::open(&data_dir, cli.config.as_deref())?;
            let stats = workspace.governor().get_stats().await;

            if cli.json {
                return print_json(&stats);
            }

            let config = workspace.governor().config();
            let budget = config.persisted_max_bytes;

            println!("Cache: {}", workspace.session_path().display());
            println!("{}", "=".repeat(70));
            println!("  Environment: {}", config.environment);
            println!("  Entries:     {}", stats.persisted_entries);
            println!(
                "  Size:        {} of {} bytes ({:.1}%)",
                stats.persisted_bytes,
                budget,
                stats.persisted_bytes as f64 / budget as f64 * 100.0
            );
            println!(
                "  Priority TTLs: high {}m, medium {}m, low {}m",
                config.priority_ttls.high.as_secs() / 60,
                config.priority_ttls.medium.as_secs() / 60,
                config.priority_ttls.low.as_secs() / 60
            );
        }

        Commands::Keys => {
            let workspace = Workspace::open(&data_dir, cli.config.as_deref())?;
            let mut listing = Vec::new();
            for key in workspace.governor().keys().await {
                let entry = workspace.governor().get_entry(&key).await;
                listing.push(KeyListing {
                    written_at: entry.as_ref().map(|e| e.written_at),
                    ttl_secs: entry.as_ref().map(|e| e.ttl().as_secs()),
                    source: entry.map(|e| e.source),
                    key,
                });
            }

            if cli.json {
                return print_json(&listing);
            }

            if listing.is_empty() {
                println!("Cache is empty.");
            } else {
                println!("Cached keys ({}):", listing.len());
                for item in &listing {
                    match (item.written_at, item.ttl_secs, &item.source) {
                        (Some(written_at), Some(ttl), Some(source)) => println!(
                            "  {}  written {}  ttl {}s  source {}",
                            item.key,
                            written_at.format("%Y-%m-%d %H:%M"),
                            ttl,
                            source
                        ),
                        _ => println!("  {}  (expired)", item.key),
                    }
                }
            }
        }

        Commands::Cleanup => {
            let workspace = Workspace::open(&data_dir, cli.config.as_deref())?;
            let report = workspace.governor().perform_cleanup().await;

            if cli.json {
                return print_json(&report);
            }
            if report.is_empty() {
                println!("Nothing to clean up.");
            } else {
                println!("Cleanup complete: {}", report);
            }
        }

        Commands::Invalidate { ref key, prefix } => {
            let workspace = Workspace::open(&data_dir, cli.config.as_deref())?;
            let governor = workspace.governor();

            if prefix {
                let removed = governor.invalidate_prefix(key).await;
                println!("Removed {} entries starting with '{}'", removed, key);
            } else if governor.invalidate(key).await {
                println!("Removed '{}'", key);
            } else {
                println!("No entry for '{}'", key);
            }
        }

        Commands::Clear => {
            let workspace = Workspace::open(&data_dir, cli.config.as_deref())?;
            let removed = workspace.governor().clear().await;
            println!("Cleared {} entries", removed);
        }

        Commands::Quota { ref provider } => {
            let workspace = Workspace::open(&data_dir, cli.config.as_deref())?;
            let governor = workspace.governor();

            let usage = match provider {
                Some(provider) => vec![governor.quota_usage(provider).await],
                None => governor.all_quota_usage().await,
            };

            if cli.json {
                return print_json(&usage);
            }
            if usage.is_empty() {
                println!("No providers configured or called yet.");
            } else {
                println!("Quota ({})", governor.config().environment);
                println!("{}", "=".repeat(70));
                for entry in &usage {
                    print_usage(entry);
                }
            }
        }

        Commands::QuotaReset { ref provider } => {
            let workspace = Workspace::open(&data_dir, cli.config.as_deref())?;
            workspace.governor().reset_quota(provider).await;
            println!("Quota counters reset for '{}'", provider);
        }

        Commands::Maintain { interval_secs } => {
            let mut config = Workspace::load_config(&data_dir, cli.config.as_deref())?;
            config.enable_auto_cleanup = true;
            if let Some(secs) = interval_secs {
                config.cleanup_interval = Duration::from_secs(secs.max(1));
            }

            let workspace = Workspace::new(&data_dir, config)?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = ContentGovernor::start_auto_cleanup(workspace.governor().clone(), shutdown_rx)
                .context("Auto cleanup could not be started")?;

            println!(
                "Maintaining {} every {}s (Ctrl-C to stop)",
                workspace.session_path().display(),
                workspace.governor().config().cleanup_interval.as_secs()
            );

            tokio::signal::ctrl_c().await?;
            let _ = shutdown_tx.send(true);
            handle.await?;
            println!("Stopped.");
        }
    }

    Ok(())
}

/// One row of the `keys` listing; expired entries carry no details
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyListing {
    key: String,
    written_at: Option<DateTime<Utc>>,
    ttl_secs: Option<u64>,
    source: Option<String>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_usage(usage: &QuotaUsage) {
    let marker = if usage.available() { "✓" } else { "✗" };
    println!("{} {}", marker, usage);

    if let Some(last) = usage.last_call_at {
        let status = usage
            .last_status
            .map(|s| format!(" (status {})", s))
            .unwrap_or_default();
        println!("    last call {}{}", last.format("%Y-%m-%d %H:%M:%S"), status);
    }
    println!(
        "    {} calls, {} bytes received in total",
        usage.total_calls, usage.total_response_bytes
    );
}
