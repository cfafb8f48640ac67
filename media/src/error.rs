//! Media transport errors.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    // ---
    /// Socket failed while the stream was supposed to be running.
    ///
    /// Errors raised after the stop signal are swallowed by the tasks and
    /// never surface as this variant.
    #[error("media socket closed")]
    SocketClosed(#[source] io::Error),

    /// Datagram of the wrong shape; dropped, never fatal.
    #[error("malformed datagram: {0}")]
    MalformedDatagram(String),

    /// Opaque failure reported by a codec or device collaborator.
    #[error("codec failure: {0}")]
    CodecFailure(String),

    #[error("media I/O error")]
    Io(#[from] io::Error),
}

impl From<hound::Error> for MediaError {
    fn from(e: hound::Error) -> Self {
        // ---
        match e {
            hound::Error::IoError(io) => MediaError::Io(io),
            other => MediaError::CodecFailure(other.to_string()),
        }
    }
}
