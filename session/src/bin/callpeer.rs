//! Peer-to-peer call endpoint - CLI binary.
//!
//! One side listens for the signaling connection, the other connects to it.
//! Both then discover their endpoints via STUN, trade offer and answer as
//! JSON lines, punch the video and audio paths and stream a test pattern
//! plus audio until either side hangs up.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use media::audio::{ToneSource, WavRecorder, WavSource};
use media::video::TestPattern;
use media::{AudioSink, AudioSource, FrameCounter, MediaDevices};
use peercall_common::{
    init_tracing, AudioConfig, CallConfig, ColorWhen, MetricsContext, MetricsServerConfig,
};
use session::{CallSession, CallSignal, CallState, LineSignaling, SignalingError};

/// Callpeer - place or answer a peer-to-peer video call
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Wait for the caller's signaling connection on this address
    #[arg(short, long, conflicts_with = "connect", required_unless_present = "connect")]
    listen: Option<String>,

    /// Call the peer listening on this address
    #[arg(short, long)]
    connect: Option<String>,

    /// Local IPv4 address for the media sockets
    #[arg(long, default_value = "0.0.0.0")]
    bind_ip: Ipv4Addr,

    /// Decline the incoming call (callee only)
    #[arg(long)]
    reject: bool,

    /// WAV file to send as audio (16-bit PCM); a tone is sent otherwise
    #[arg(long)]
    wav_in: Option<PathBuf>,

    /// Record received audio to this WAV file
    #[arg(long)]
    wav_out: Option<PathBuf>,

    /// Frequency of the fallback tone in Hz
    #[arg(long, default_value = "440")]
    tone_hz: f64,

    /// Size of each test-pattern video frame in bytes
    #[arg(long, default_value = "20000")]
    frame_size: usize,

    /// Hang up after this many seconds
    #[arg(long)]
    duration_secs: Option<u64>,

    /// STUN server (overrides the config file)
    #[arg(long)]
    stun_server: Option<String>,

    /// Prometheus metrics bind address (serves `GET /metrics`)
    #[arg(long)]
    metrics_bind: Option<String>,

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
    info!("Starting callpeer v{VERSION}");

    let mut config = CallConfig::load(args.config.as_deref())?;
    if let Some(server) = args.stun_server.clone() {
        config.stun.server = server;
    }

    let metrics = MetricsContext::new("callpeer")?;
    if let Some(bind) = &args.metrics_bind {
        let bind = bind.parse().context("invalid metrics bind")?;
        let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(bind));
        info!("Metrics on http://{}/metrics", bind);
    }

    let stream = match (&args.listen, &args.connect) {
        (Some(listen), _) => {
            let listener = TcpListener::bind(listen.as_str())
                .await
                .with_context(|| format!("failed to listen on {listen}"))?;
            info!("Waiting for a caller on {}", listener.local_addr()?);
            let (stream, from) = listener.accept().await?;
            info!("Signaling connection from {}", from);
            stream
        }
        (None, Some(peer)) => TcpStream::connect(peer.as_str())
            .await
            .with_context(|| format!("failed to reach {peer}"))?,
        (None, None) => bail!("either --listen or --connect is required"),
    };
    let mut signaling = LineSignaling::new(stream);

    let session = CallSession::bind(args.bind_ip, config.clone(), metrics).await?;
    let answered = if args.connect.is_some() {
        place_call(&session, &mut signaling).await?
    } else {
        answer_call(&session, &mut signaling, args.reject).await?
    };
    if !answered {
        return Ok(());
    }

    let devices = open_devices(&args, &config.audio)?;
    if let Err(e) = session.connect(devices).await {
        let _ = signaling.send(&CallSignal::End).await;
        return Err(e).context("call failed / could not connect");
    }
    info!("Call active; Ctrl-C hangs up");

    run_call(&session, &mut signaling, args.duration_secs).await
}

/// Sends our offer and waits for the answer. Returns whether it was accepted.
async fn place_call(
    session: &CallSession,
    signaling: &mut LineSignaling<TcpStream>,
) -> Result<bool> {
    // ---
    let offer = session
        .start_call()
        .await
        .context("call failed / could not connect")?;
    signaling.send(&offer).await?;
    info!("Offer sent, waiting for answer");

    loop {
        let signal = signaling.recv().await.context("no answer from peer")?;
        if matches!(signal, CallSignal::Offer { .. }) {
            warn!("Ignoring offer while calling");
            continue;
        }
        session.handle_signal(signal).await?;
        return Ok(session.state() == CallState::Accepted);
    }
}

/// Waits for an offer and answers it. Returns whether we accepted.
async fn answer_call(
    session: &CallSession,
    signaling: &mut LineSignaling<TcpStream>,
    reject: bool,
) -> Result<bool> {
    // ---
    let endpoints = loop {
        match signaling.recv().await.context("no offer from peer")? {
            CallSignal::Offer { endpoints } => break endpoints,
            other => warn!("Ignoring {:?} before an offer", other),
        }
    };
    session.receive_offer(endpoints)?;

    if reject {
        let answer = session.reject().await?;
        signaling.send(&answer).await?;
        info!("Call rejected");
        return Ok(false);
    }

    match session.accept().await {
        Ok(answer) => {
            signaling.send(&answer).await?;
            Ok(true)
        }
        Err(e) => {
            // Tell the caller instead of leaving it waiting
            let _ = signaling.send(&CallSignal::reject()).await;
            Err(e).context("call failed / could not connect")
        }
    }
}

/// Keeps the call up until a hang-up from either side or a media failure.
async fn run_call(
    session: &CallSession,
    signaling: &mut LineSignaling<TcpStream>,
    duration_secs: Option<u64>,
) -> Result<()> {
    // ---
    let hang_up_after = async {
        match duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(hang_up_after);

    let notify_peer = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Hanging up");
                break true;
            }
            _ = &mut hang_up_after => {
                info!("Call duration reached, hanging up");
                break true;
            }
            _ = session.media_stopped() => {
                warn!("Media stopped unexpectedly");
                break true;
            }
            signal = signaling.recv() => match signal {
                Ok(CallSignal::End) => break false,
                Ok(other) => warn!("Ignoring {:?} during call", other),
                Err(SignalingError::Closed) => {
                    warn!("Signaling connection lost");
                    break false;
                }
                Err(e) => warn!("Bad signal: {}", e),
            },
        }
    };

    if notify_peer {
        if let Err(e) = signaling.send(&CallSignal::End).await {
            warn!("Could not notify peer: {}", e);
        }
    }
    session.end().await.context("call ended with a media failure")?;
    info!("Call ended");
    Ok(())
}

fn open_devices(args: &Args, format: &AudioConfig) -> Result<MediaDevices> {
    // ---
    let audio_source: Box<dyn AudioSource> = match &args.wav_in {
        Some(path) => Box::new(
            WavSource::open(path, format)
                .with_context(|| format!("failed to open {}", path.display()))?
                .looping(true),
        ),
        None => Box::new(ToneSource::new(args.tone_hz, format)),
    };

    let audio_sink: Box<dyn AudioSink> = match &args.wav_out {
        Some(path) => Box::new(
            WavRecorder::create(path, format)
                .with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => default_audio_sink(format)?,
    };

    Ok(MediaDevices {
        frame_source: Box::new(TestPattern::new(args.frame_size)),
        frame_sink: Box::new(FrameCounter::new(30)),
        audio_source,
        audio_sink,
    })
}

#[cfg(feature = "audio-device")]
fn default_audio_sink(format: &AudioConfig) -> Result<Box<dyn AudioSink>> {
    // ---
    let player = media::audio::DevicePlayback::open(format).context("failed to open audio output")?;
    Ok(Box::new(player))
}

#[cfg(not(feature = "audio-device"))]
fn default_audio_sink(_format: &AudioConfig) -> Result<Box<dyn AudioSink>> {
    Ok(Box::new(media::Discard))
}
