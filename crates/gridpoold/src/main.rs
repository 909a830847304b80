//! gridpoold — the gridpool daemon.
//!
//! Loads a `gridpool.toml`, assembles a `ResourcePool` with the sources
//! it describes, and keeps it running until interrupted:
//! - node sources top the pool up from their backends
//! - the liveness monitor drops nodes that stop answering
//! - node events and periodic pool statistics are logged
//!
//! # Usage
//!
//! ```text
//! gridpoold run --config /etc/gridpool/gridpool.toml
//! gridpoold check --config gridpool.toml
//! gridpoold --json-logs run --preempt
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gridpool::ResourcePool;
use gridpool_core::{NodeEvent, PoolConfig};

#[derive(Parser)]
#[command(name = "gridpoold", about = "gridpool resource manager daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the resource pool until Ctrl-C.
    Run {
        /// Configuration file.
        #[arg(long, default_value = "gridpool.toml")]
        config: PathBuf,

        /// Pool statistics interval in seconds.
        #[arg(long, default_value = "60")]
        stats_interval: u64,

        /// Release lent nodes right away on shutdown instead of waiting
        /// for their users.
        #[arg(long)]
        preempt: bool,
    },
    /// Validate a configuration file and print it resolved.
    Check {
        #[arg(long, default_value = "gridpool.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Run {
            config,
            stats_interval,
            preempt,
        } => run(&config, stats_interval, preempt).await,
        Command::Check { config } => check(&config),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gridpool=debug,gridpoold=debug"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn load(path: &Path) -> anyhow::Result<PoolConfig> {
    PoolConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    info!(path = %path.display(), sources = config.sources.len(), "configuration is valid");
    Ok(())
}

async fn run(path: &Path, stats_interval: u64, preempt: bool) -> anyhow::Result<()> {
    let config = load(path)?;
    info!(path = %path.display(), "gridpoold starting");

    let pool = ResourcePool::new(config).await?;
    let events = tokio::spawn(log_events(pool.subscribe()));

    // ── Main loop ──────────────────────────────────────────────

    let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = pool.stats().await;
                info!(
                    total = stats.nodes.total,
                    free = stats.nodes.free,
                    busy = stats.nodes.busy,
                    to_release = stats.nodes.to_release,
                    locked = stats.nodes.locked,
                    sources = stats.sources.len(),
                    monitor = ?stats.monitor,
                    "pool stats"
                );
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("installing Ctrl-C handler")?;
                info!("shutdown signal received");
                break;
            }
        }
    }

    pool.shutdown(preempt).await;
    events.abort();

    info!("gridpoold stopped");
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<NodeEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => info!(url = %event.url, source = %event.source_id, kind = ?event.kind, "node event"),
            Err(broadcast::error::RecvError::Lagged(missed)) => warn!(missed, "node event log lagging"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
