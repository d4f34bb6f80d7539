//! GCL Server - replicated log daemon
//!
//! Usage: `gcl-server --config gcl.toml [-v] [--log-json]`

use clap::Parser;
use gcl_server::{Config, GclServer};
use std::path::PathBuf;
use std::thread;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// GCL Server CLI arguments
#[derive(Parser, Debug)]
#[command(name = "gcl-server")]
#[command(about = "Replicated GCL log server", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let worker_threads = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(2, 16);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .thread_name("gcl-worker")
        .enable_all()
        .build()?;

    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "gcl_server=debug,gcl_core=debug".into())
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "gcl_server=info,gcl_core=info".into())
    };

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    rt.block_on(async_main(args.config))
}

async fn async_main(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = match config_path {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    config.apply_process_env()?;

    let server = GclServer::start(config).await?;
    tracing::info!(
        server = %server.name(),
        addr = %server.local_addr(),
        "ready; press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    let stats = server.service().stats();
    tracing::info!(
        local_appends = stats.local_appends,
        forwards_sent = stats.forwards_sent,
        replies_sent = stats.replies_sent,
        quorum_failures = stats.quorum_failures,
        records_backfilled = stats.records_backfilled,
        "final replication stats"
    );
    server.shutdown().await;
    Ok(())
}
