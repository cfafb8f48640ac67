//! Rendezvous protocol: swap endpoint tuples through a pairing server.
//!
//! Each participant opens a TCP connection and writes one line,
//! `localIp:localPort:publicIp:publicPort`. The server holds the first
//! participant until a second arrives, then answers each with the other's
//! line verbatim. If nobody shows up in time, or the line is not a valid
//! tuple, the answer is `ERROR: <reason>` instead.
//!
//! ```text
//!   A                      server                      B
//!   |-- 10.0.0.5:4000:... -->|                         |
//!   |                        |<-- 192.168.1.9:5000:... -|
//!   |<-- 192.168.1.9:5000:...|                         |
//!   |                        |-- 10.0.0.5:4000:... ---->|
//! ```

use peercall_common::{EndpointPair, RendezvousConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RendezvousError;

const ERROR_PREFIX: &str = "ERROR:";
const NO_PEER: &str = "no peer available";
const MALFORMED: &str = "malformed endpoint tuple";

/// Longest line the server accepts (two dotted quads, two ports, separators).
const MAX_LINE: usize = 64;

/// Sends our tuple to the rendezvous server and returns the peer's.
///
/// The whole exchange (connect, send, wait for the partner) is bounded by
/// `timeout`.
///
/// # Errors
///
/// - [`RendezvousError::Rejected`] if the server answered `ERROR: ...`
/// - [`RendezvousError::MalformedTuple`] if the answer is not a valid tuple
/// - [`RendezvousError::Closed`] if the server hung up without answering
/// - [`RendezvousError::Timeout`] if no answer arrived in time
pub async fn exchange(
    server: impl ToSocketAddrs,
    ours: &EndpointPair,
    timeout: Duration,
) -> Result<EndpointPair, RendezvousError> {
    // ---
    tokio::time::timeout(timeout, exchange_inner(server, ours))
        .await
        .map_err(|_| RendezvousError::Timeout(timeout))?
}

async fn exchange_inner(
    server: impl ToSocketAddrs,
    ours: &EndpointPair,
) -> Result<EndpointPair, RendezvousError> {
    // ---
    let mut stream = TcpStream::connect(server).await?;
    debug!("Connected to rendezvous server {}", stream.peer_addr()?);

    stream.write_all(format!("{ours}\n").as_bytes()).await?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(RendezvousError::Closed);
    }

    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(reason) = line.strip_prefix(ERROR_PREFIX) {
        return Err(RendezvousError::Rejected(reason.trim().to_string()));
    }

    let peer: EndpointPair = line.parse()?;
    info!("Rendezvous paired us ({}) with {}", ours, peer);
    Ok(peer)
}

/// A validated participant waiting for its partner's line.
struct Arrival {
    // ---
    from: SocketAddr,
    line: String,
    reply: oneshot::Sender<String>,
}

/// Pairing server for the rendezvous protocol.
///
/// Participants are paired strictly in arrival order, two at a time. After a
/// pair has been served the server is ready for the next one.
pub struct RendezvousServer {
    // ---
    listener: TcpListener,
    config: RendezvousConfig,
}

impl RendezvousServer {
    // ---
    /// Binds the listener on `config.bind`.
    pub async fn bind(config: RendezvousConfig) -> Result<Self, RendezvousError> {
        // ---
        let listener = TcpListener::bind(config.bind.as_str()).await?;
        info!("Rendezvous server listening on {}", listener.local_addr()?);
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RendezvousError> {
        // ---
        Ok(self.listener.local_addr()?)
    }

    /// Serves participants until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), RendezvousError> {
        // ---
        let (arrivals_tx, arrivals_rx) = mpsc::channel::<Arrival>(16);
        let pairing = tokio::spawn(pair_arrivals(arrivals_rx));
        let pair_timeout = self.config.pair_timeout();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Rendezvous server stopping");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, from) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    let arrivals = arrivals_tx.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            result = serve_participant(stream, from, arrivals, pair_timeout) => {
                                if let Err(e) = result {
                                    debug!("Participant {} dropped: {}", from, e);
                                }
                            }
                        }
                    });
                }
            }
        }

        drop(arrivals_tx);
        pairing.abort();
        Ok(())
    }
}

/// Reads one tuple, waits for a partner and writes the partner's line back.
async fn serve_participant(
    stream: TcpStream,
    from: SocketAddr,
    arrivals: mpsc::Sender<Arrival>,
    pair_timeout: Duration,
) -> Result<(), RendezvousError> {
    // ---
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).take(MAX_LINE as u64 + 2);

    let mut raw = String::new();
    let read = tokio::time::timeout(pair_timeout, reader.read_line(&mut raw))
        .await
        .map_err(|_| RendezvousError::Timeout(pair_timeout))??;
    if read == 0 {
        return Err(RendezvousError::Closed);
    }

    let line = raw.trim_end_matches(['\r', '\n']).to_string();
    if let Err(e) = line.parse::<EndpointPair>() {
        warn!("Rejecting tuple {:?} from {}: {}", line, from, e);
        write_half
            .write_all(format!("{ERROR_PREFIX} {MALFORMED}\n").as_bytes())
            .await?;
        return Err(RendezvousError::MalformedTuple(e));
    }
    debug!("Participant {} registered {}", from, line);

    let (reply_tx, reply_rx) = oneshot::channel();
    arrivals
        .send(Arrival {
            from,
            line,
            reply: reply_tx,
        })
        .await
        .map_err(|_| RendezvousError::Closed)?;

    let response = match tokio::time::timeout(pair_timeout, reply_rx).await {
        Ok(Ok(peer_line)) => peer_line,
        Ok(Err(_)) => return Err(RendezvousError::Closed),
        Err(_) => {
            info!("No partner for {} within {:?}", from, pair_timeout);
            format!("{ERROR_PREFIX} {NO_PEER}")
        }
    };

    write_half
        .write_all(format!("{response}\n").as_bytes())
        .await?;
    write_half.shutdown().await?;
    Ok(())
}

/// Pairing actor: owns the single waiting slot.
async fn pair_arrivals(mut arrivals: mpsc::Receiver<Arrival>) {
    // ---
    let mut waiting: Option<Arrival> = None;

    while let Some(arrival) = arrivals.recv().await {
        let first = match waiting.take() {
            Some(first) if !first.reply.is_closed() => first,
            Some(gone) => {
                debug!("Waiting participant {} left; {} now waits", gone.from, arrival.from);
                waiting = Some(arrival);
                continue;
            }
            None => {
                waiting = Some(arrival);
                continue;
            }
        };

        let Arrival {
            from: first_from,
            line: first_line,
            reply: first_reply,
        } = first;

        if first_reply.send(arrival.line.clone()).is_err() {
            waiting = Some(arrival);
            continue;
        }

        info!("Paired {} with {}", first_from, arrival.from);
        if arrival.reply.send(first_line).is_err() {
            debug!("Participant {} left before its reply", arrival.from);
        }
    }
}
