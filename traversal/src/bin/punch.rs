//! Standalone hole-punching tool - CLI binary.
//!
//! Learns this host's public endpoint via STUN, swaps tuples with a peer via
//! the rendezvous server, punches, then trades a few text datagrams to prove
//! the path works.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use peercall_common::{init_tracing, CallConfig, ColorWhen, EndpointPair, MetricsContext};
use traversal::{exchange, local_endpoint, HolePuncher, StunClient, PROBE};

/// Punch - open a direct UDP path to a peer behind NAT
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Rendezvous server address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:8888")]
    rendezvous: String,

    /// Local UDP port (0 picks one)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// STUN server (overrides the config file)
    #[arg(long)]
    stun_server: Option<String>,

    /// Skip STUN and advertise the local endpoint as public (same LAN)
    #[arg(long)]
    no_stun: bool,

    /// Text datagrams to exchange once the path is open
    #[arg(short, long, default_value = "5")]
    messages: u32,

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
    info!("Starting punch v{VERSION}");

    let mut config = CallConfig::load(args.config.as_deref())?;
    if let Some(server) = args.stun_server {
        config.stun.server = server;
    }

    let metrics = MetricsContext::new("punch")?;
    let socket = UdpSocket::bind(("0.0.0.0", args.port))
        .await
        .context("failed to bind UDP socket")?;

    let stun = StunClient::new(config.stun.clone(), metrics.clone());
    let ours = if args.no_stun {
        let rendezvous: SocketAddr = tokio::net::lookup_host(args.rendezvous.as_str())
            .await?
            .next()
            .context("rendezvous server has no address")?;
        let local = local_endpoint(&socket, rendezvous)?;
        EndpointPair::new(local, local)
    } else {
        let route_hint = stun.resolve_server(true).await?;
        let local = local_endpoint(&socket, route_hint)?;
        let public = match stun.discover_public_endpoint(&socket).await? {
            SocketAddr::V4(public) => public,
            SocketAddr::V6(public) => bail!("STUN mapped us to IPv6 {public}; tuples are IPv4"),
        };
        EndpointPair::new(local, public)
    };
    info!("Our tuple: {}", ours);

    let peer = exchange(
        args.rendezvous.as_str(),
        &ours,
        config.rendezvous.pair_timeout(),
    )
    .await
    .context("rendezvous failed")?;
    info!("Peer tuple: {}", peer);

    let puncher = HolePuncher::new(config.punch.clone(), metrics);
    let outcome = puncher
        .punch(&socket, &peer, &CancellationToken::new())
        .await
        .context("could not connect")?;

    chat(&socket, outcome.peer, args.messages).await
}

/// Sends `count` numbered lines to `peer` and prints whatever comes back.
async fn chat(socket: &UdpSocket, peer: SocketAddr, count: u32) -> Result<()> {
    // ---
    let mut buf = vec![0u8; 1500];
    for n in 1..=count {
        let message = format!("hello #{n} from {}", socket.local_addr()?);
        socket.send_to(message.as_bytes(), peer).await?;

        match tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) if &buf[..len] != PROBE => {
                info!("{} says: {}", from, String::from_utf8_lossy(&buf[..len]));
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e).context("receive failed"),
            Err(_) => warn!("No message from {} this round", peer),
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    info!("Done");
    Ok(())
}
