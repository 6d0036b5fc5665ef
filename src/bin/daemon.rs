//! Mirrorsync daemon
//!
//! Run with: mirrorsync-daemon

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mirrorsync::config::{MirrorConfig, DEFAULT_CONFIG_PATH, DEFAULT_DB_PATH};
use mirrorsync::error::Result;
use mirrorsync::storage::StateStore;
use mirrorsync::sync::{
    shutdown_channel, wait_for_termination, ExecutorSettings, RepositorySource, Scheduler,
    SchedulerSettings, SyncExecutor,
};
use mirrorsync::transfer::{ProcessRunner, ShapingPolicy};

#[derive(Parser, Debug)]
#[command(name = "mirrorsync-daemon")]
#[command(about = "Keep repository mirrors in sync on a fixed interval")]
#[command(version)]
struct Args {
    /// Configuration document, re-read every cycle
    #[arg(long, env = "MIRROR_SYNC_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Database path
    #[arg(long, env = "MIRROR_SYNC_DB", default_value = DEFAULT_DB_PATH)]
    db_path: String,

    /// Also serve the status endpoint on this address
    #[cfg(feature = "http")]
    #[arg(long, env = "MIRROR_SYNC_STATUS_ADDR")]
    status_addr: Option<std::net::SocketAddr>,

    /// Log as JSON lines
    #[arg(long, env = "MIRROR_SYNC_JSON_LOGS")]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    // Expand ~ in paths
    let config_path = PathBuf::from(shellexpand::tilde(&args.config).as_ref());
    let db_path = shellexpand::tilde(&args.db_path).to_string();

    let config = MirrorConfig::load_or_empty(&config_path);

    // The only fatal failure: nowhere to record outcomes
    let store = StateStore::open(db_path)?;
    tracing::info!("State store at {}", store.db_path());

    let executor = Arc::new(SyncExecutor::with_runner(
        store.clone(),
        Arc::new(ProcessRunner::new()),
        ShapingPolicy::detect(),
        ExecutorSettings::from(&config),
    ));
    let scheduler = Arc::new(Scheduler::new(
        executor,
        RepositorySource::File(config_path),
        SchedulerSettings::from(&config),
    ));

    let (handle, signal) = shutdown_channel();

    #[cfg(feature = "http")]
    let status_task = args.status_addr.map(|addr| {
        let server = mirrorsync::status::StatusServer::new(
            mirrorsync::status::StatusReader::from_store(store.clone()),
            addr,
        );
        let signal = signal.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start(signal).await {
                tracing::error!("Status server failed: {}", e);
            }
        })
    });

    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run(signal));

    wait_for_termination().await;
    handle.request();

    if let Err(e) = scheduler_task.await {
        tracing::error!("Scheduler task failed: {}", e);
    }

    #[cfg(feature = "http")]
    if let Some(task) = status_task {
        let _ = task.await;
    }

    if let Err(e) = store.checkpoint() {
        tracing::warn!("Final checkpoint failed: {}", e);
    }

    tracing::info!("Mirrorsync daemon exiting");
    Ok(())
}
