//! Rendezvous pairing server - CLI binary.
//!
//! Pairs participants two at a time and hands each the other's
//! `localIp:localPort:publicIp:publicPort` tuple.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use peercall_common::{init_tracing, CallConfig, ColorWhen};
use traversal::RendezvousServer;

/// Rendezvous server - pair two peers for hole punching
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// TCP address to listen on (overrides the config file)
    #[arg(short, long)]
    bind: Option<String>,

    /// Seconds a participant waits for a partner
    #[arg(long)]
    pair_timeout_secs: Option<u64>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorWhen,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();
    init_tracing(args.color, "info")?;
    info!("Starting rendezvous server v{VERSION}");

    let mut config = CallConfig::load(args.config.as_deref())?.rendezvous;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(secs) = args.pair_timeout_secs {
        config.pair_timeout_ms = secs * 1000;
    }
    info!("Pair timeout: {:?}", config.pair_timeout());

    let server = RendezvousServer::bind(config)
        .await
        .context("failed to bind rendezvous server")?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            ctrl_c.cancel();
        }
    });

    server.run(cancel).await.context("rendezvous server failed")?;
    Ok(())
}
