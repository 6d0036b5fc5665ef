//! Mirrorsync status server
//!
//! Run with: mirrorsync-status

use std::net::SocketAddr;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mirrorsync::config::DEFAULT_DB_PATH;
use mirrorsync::error::Result;
use mirrorsync::status::{StatusReader, StatusServer, DEFAULT_STATUS_ADDR};
use mirrorsync::sync::{shutdown_channel, wait_for_termination};

#[derive(Parser, Debug)]
#[command(name = "mirrorsync-status")]
#[command(about = "Serve mirror sync outcomes over HTTP")]
#[command(version)]
struct Args {
    /// Database path
    #[arg(long, env = "MIRROR_SYNC_DB", default_value = DEFAULT_DB_PATH)]
    db_path: String,

    /// Listen address
    #[arg(long, env = "MIRROR_SYNC_STATUS_ADDR", default_value = DEFAULT_STATUS_ADDR)]
    addr: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let db_path = shellexpand::tilde(&args.db_path).to_string();

    let (handle, signal) = shutdown_channel();
    tokio::spawn(async move {
        wait_for_termination().await;
        handle.request();
    });

    StatusServer::new(StatusReader::new(db_path), args.addr)
        .start(signal)
        .await?;

    Ok(())
}
