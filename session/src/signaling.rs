//! Newline-delimited JSON transport for [`CallSignal`]s.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::SignalingError;
use crate::signal::CallSignal;

/// Longest signal line accepted from the peer.
pub const MAX_SIGNAL_LINE: usize = 4096;

/// Sends and receives one [`CallSignal`] per line over a byte stream.
///
/// [`LineSignaling::recv`] keeps partial input inside the adapter, so it can
/// be raced against other futures in `tokio::select!` without losing data.
///
/// # Example
///
/// ```
/// use session::{CallSignal, LineSignaling};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), session::SignalingError> {
/// let (a, b) = tokio::io::duplex(1024);
/// let mut caller = LineSignaling::new(a);
/// let mut callee = LineSignaling::new(b);
///
/// caller.send(&CallSignal::End).await?;
/// assert_eq!(callee.recv().await?, CallSignal::End);
/// # Ok(())
/// # }
/// ```
pub struct LineSignaling<S> {
    // ---
    stream: S,
    pending: Vec<u8>,
}

impl<S> LineSignaling<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ---
    pub fn new(stream: S) -> Self {
        // ---
        Self {
            stream,
            pending: Vec::with_capacity(256),
        }
    }

    pub async fn send(&mut self, signal: &CallSignal) -> Result<(), SignalingError> {
        // ---
        let mut line = serde_json::to_vec(signal)?;
        line.push(b'\n');
        self.stream.write_all(&line).await?;
        self.stream.flush().await?;
        debug!("Signal sent: {:?}", signal);
        Ok(())
    }

    /// Waits for the next signal.
    ///
    /// # Errors
    ///
    /// - [`SignalingError::Closed`] once the peer hangs up
    /// - [`SignalingError::Decode`] if a line is not a valid signal
    /// - [`SignalingError::LineTooLong`] if no newline arrives within
    ///   [`MAX_SIGNAL_LINE`] bytes
    pub async fn recv(&mut self) -> Result<CallSignal, SignalingError> {
        // ---
        loop {
            if let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=end).collect();
                let text = trim_line(&line);
                if text.is_empty() {
                    continue;
                }
                let signal = serde_json::from_slice(text)?;
                debug!("Signal received: {:?}", signal);
                return Ok(signal);
            }

            if self.pending.len() > MAX_SIGNAL_LINE {
                return Err(SignalingError::LineTooLong(MAX_SIGNAL_LINE));
            }

            if self.stream.read_buf(&mut self.pending).await? == 0 {
                return Err(SignalingError::Closed);
            }
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    // ---
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r' | b' ') {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::signal::MediaEndpoints;

    #[tokio::test]
    async fn test_signals_in_order() {
        // ---
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = LineSignaling::new(a);
        let mut rx = LineSignaling::new(b);

        let endpoints = MediaEndpoints {
            video: "10.0.0.5:40000:203.0.113.9:61000".parse().unwrap(),
            audio: "10.0.0.5:40001:203.0.113.9:61001".parse().unwrap(),
        };
        tx.send(&CallSignal::Offer { endpoints }).await.unwrap();
        tx.send(&CallSignal::End).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), CallSignal::Offer { endpoints });
        assert_eq!(rx.recv().await.unwrap(), CallSignal::End);
    }

    #[tokio::test]
    async fn test_crlf_and_blank_lines() {
        // ---
        let (mut raw, b) = tokio::io::duplex(4096);
        let mut rx = LineSignaling::new(b);

        raw.write_all(b"\r\n{\"type\":\"end\"}\r\n").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), CallSignal::End);
    }

    #[tokio::test]
    async fn test_split_line_survives_cancellation() {
        // ---
        let (mut raw, b) = tokio::io::duplex(4096);
        let mut rx = LineSignaling::new(b);

        raw.write_all(b"{\"type\":").await.unwrap();
        let early = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
        assert!(early.is_err());

        raw.write_all(b"\"end\"}\n").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), CallSignal::End);
    }

    #[tokio::test]
    async fn test_garbage_and_hangup() {
        // ---
        let (mut raw, b) = tokio::io::duplex(4096);
        let mut rx = LineSignaling::new(b);

        raw.write_all(b"INITIATE_VIDEO_CALL\n").await.unwrap();
        assert!(matches!(rx.recv().await, Err(SignalingError::Decode(_))));

        drop(raw);
        assert!(matches!(rx.recv().await, Err(SignalingError::Closed)));
    }
}
