//! Call-level errors.

use media::MediaError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use traversal::{PunchError, StunError};

use crate::state::{CallEvent, CallState};

/// Why a call operation did not go through.
#[derive(Debug, Error)]
pub enum CallError {
    // ---
    /// Endpoint discovery failed; the call went to `FAILED`
    #[error("could not discover public endpoint")]
    Stun(#[from] StunError),

    /// Hole punching failed; the call went to `FAILED`
    #[error("could not connect to peer")]
    Punch(#[from] PunchError),

    #[error("cannot {event} while {from}")]
    InvalidTransition { from: CallState, event: CallEvent },

    /// STUN answered with an address that cannot be signaled
    #[error("mapped address {0} is not IPv4")]
    UnusableMapping(SocketAddr),

    /// An accepting answer arrived without the callee's endpoints
    #[error("answer accepted the call but carried no endpoints")]
    MissingEndpoints,

    /// The media sockets were already released
    #[error("media sockets closed")]
    SocketClosed,

    /// A media task failed while the call was active
    #[error("media failure")]
    Media(#[from] MediaError),

    #[error("call socket error")]
    Io(#[from] io::Error),
}

/// Failure of the signaling channel.
#[derive(Debug, Error)]
pub enum SignalingError {
    // ---
    #[error("signaling connection closed")]
    Closed,

    #[error("signal line longer than {0} bytes")]
    LineTooLong(usize),

    #[error("undecodable signal")]
    Decode(#[from] serde_json::Error),

    #[error("signaling I/O error")]
    Io(#[from] io::Error),
}
