//! Error types for discovery, rendezvous and punching.
//!
//! All three are terminal for call setup: callers surface them as a failed
//! call and never retry automatically.

use peercall_common::EndpointParseError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failure of a STUN Binding transaction.
#[derive(Debug, Error)]
pub enum StunError {
    // ---
    #[error("STUN server did not answer within {0:?}")]
    Timeout(Duration),

    #[error("malformed STUN response: {0}")]
    MalformedResponse(String),

    #[error("cannot resolve STUN server {server}")]
    Resolve {
        server: String,
        #[source]
        source: io::Error,
    },

    #[error("STUN socket error")]
    Io(#[from] io::Error),
}

/// Failure of a hole-punching run.
#[derive(Debug, Error)]
pub enum PunchError {
    // ---
    #[error("no datagram from peer after {attempts} probe bursts")]
    NoResponse { attempts: u32 },

    #[error("hole punching cancelled")]
    Cancelled,

    #[error("punch socket error")]
    Io(#[from] io::Error),
}

/// Failure of a rendezvous exchange.
#[derive(Debug, Error)]
pub enum RendezvousError {
    // ---
    /// The server answered `ERROR: <reason>`.
    #[error("rendezvous server refused: {0}")]
    Rejected(String),

    #[error("malformed endpoint tuple")]
    MalformedTuple(#[from] EndpointParseError),

    #[error("rendezvous connection closed before a reply")]
    Closed,

    #[error("no reply from rendezvous server within {0:?}")]
    Timeout(Duration),

    #[error("rendezvous I/O error")]
    Io(#[from] io::Error),
}
