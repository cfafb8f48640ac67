//! Socket I/O shared by the media loops.
//!
//! Every loop races its socket call against the stop token. Once the token
//! has fired, any socket error is the expected consequence of teardown and
//! is reported as a clean stop; before that it is a lost connection.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::MediaError;

/// Outcome of one receive attempt.
pub(crate) enum Received {
    Datagram { len: usize, from: SocketAddr },
    Stopped,
}

/// Waits for the next datagram or the stop signal.
pub(crate) async fn recv_or_stop(
    socket: &UdpSocket,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<Received, MediaError> {
    // ---
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Received::Stopped),
            received = socket.recv_from(buf) => match received {
                Ok((len, from)) => return Ok(Received::Datagram { len, from }),
                Err(e) => {
                    if let Some(outcome) = classify(e, cancel)? {
                        return Ok(outcome);
                    }
                }
            },
        }
    }
}

/// Sends one datagram; `Ok(false)` means the stop signal was raised.
pub(crate) async fn send_or_stop(
    socket: &UdpSocket,
    datagram: &[u8],
    peer: SocketAddr,
    cancel: &CancellationToken,
) -> Result<bool, MediaError> {
    // ---
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(false),
        sent = socket.send_to(datagram, peer) => match sent {
            Ok(_) => Ok(true),
            Err(e) => match classify(e, cancel)? {
                Some(Received::Stopped) => Ok(false),
                _ => Ok(true),
            },
        },
    }
}

/// `Ok(None)` to carry on, `Ok(Some(Stopped))` after teardown, `Err` on loss.
fn classify(e: io::Error, cancel: &CancellationToken) -> Result<Option<Received>, MediaError> {
    // ---
    if cancel.is_cancelled() {
        return Ok(Some(Received::Stopped));
    }
    match e.kind() {
        // ICMP errors bounced back from an earlier send; UDP keeps going
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
            debug!("Transient socket error: {}", e);
            Ok(None)
        }
        _ => Err(MediaError::SocketClosed(e)),
    }
}
