//! Codec and device seams.
//!
//! The transport never looks inside a video frame or interprets samples.
//! Encoding, decoding, capture and display live behind these four traits;
//! the media tasks only move bytes between them and the sockets.
//!
//! All traits are synchronous and `Send`: each implementation is moved into
//! exactly one media task and called from there.

use crate::error::MediaError;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Producer of encoded video frames.
pub trait FrameSource: Send {
    /// Next encoded frame, or `None` once the source is exhausted.
    ///
    /// A [`MediaError::CodecFailure`] skips this frame only.
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, MediaError>;
}

/// Consumer of reassembled (still encoded) video frames.
pub trait FrameSink: Send {
    /// Decodes and displays one frame. Errors skip the frame.
    fn present(&mut self, frame: &[u8]) -> Result<(), MediaError>;
}

/// Producer of raw PCM, little-endian interleaved.
pub trait AudioSource: Send {
    /// Fills `buf` with up to `buf.len()` bytes.
    ///
    /// Returns the number of bytes written, which need not be a whole number
    /// of sample frames, or `None` once the source is exhausted.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<Option<usize>, MediaError>;
}

/// Consumer of raw PCM chunks in playback order.
pub trait AudioSink: Send {
    fn play(&mut self, chunk: &[u8]) -> Result<(), MediaError>;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, MediaError> {
        (**self).next_frame()
    }
}

impl<T: FrameSink + ?Sized> FrameSink for Box<T> {
    fn present(&mut self, frame: &[u8]) -> Result<(), MediaError> {
        (**self).present(frame)
    }
}

impl<T: AudioSource + ?Sized> AudioSource for Box<T> {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<Option<usize>, MediaError> {
        (**self).read_chunk(buf)
    }
}

impl<T: AudioSink + ?Sized> AudioSink for Box<T> {
    fn play(&mut self, chunk: &[u8]) -> Result<(), MediaError> {
        (**self).play(chunk)
    }
}

/// Replays a fixed list of frames, then ends.
#[derive(Debug, Default)]
pub struct QueuedFrames {
    frames: VecDeque<Vec<u8>>,
}

impl QueuedFrames {
    // ---
    pub fn new(frames: impl IntoIterator<Item = Vec<u8>>) -> Self {
        // ---
        Self {
            frames: frames.into_iter().collect(),
        }
    }
}

impl FrameSource for QueuedFrames {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, MediaError> {
        // ---
        Ok(self.frames.pop_front())
    }
}

/// Forwards every presented frame into a channel.
pub struct ChannelFrameSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelFrameSink {
    // ---
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl FrameSink for ChannelFrameSink {
    fn present(&mut self, frame: &[u8]) -> Result<(), MediaError> {
        // ---
        // A dropped receiver just means nobody is watching any more
        let _ = self.tx.send(frame.to_vec());
        Ok(())
    }
}

/// Forwards every played chunk into a channel.
pub struct ChannelAudioSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelAudioSink {
    // ---
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AudioSink for ChannelAudioSink {
    fn play(&mut self, chunk: &[u8]) -> Result<(), MediaError> {
        // ---
        let _ = self.tx.send(chunk.to_vec());
        Ok(())
    }
}

/// Display stand-in: counts frames and logs a summary now and then.
#[derive(Debug)]
pub struct FrameCounter {
    // ---
    frames: u64,
    bytes: u64,
    log_every: u64,
}

impl FrameCounter {
    // ---
    pub fn new(log_every: u64) -> Self {
        // ---
        Self {
            frames: 0,
            bytes: 0,
            log_every: log_every.max(1),
        }
    }

    pub fn frames(&self) -> u64 {
        // ---
        self.frames
    }
}

impl FrameSink for FrameCounter {
    fn present(&mut self, frame: &[u8]) -> Result<(), MediaError> {
        // ---
        self.frames += 1;
        self.bytes += frame.len() as u64;
        debug!("Frame #{} ({} bytes)", self.frames, frame.len());

        if self.frames.is_multiple_of(self.log_every) {
            info!(
                "Displayed {} frames ({:.1} KiB total)",
                self.frames,
                self.bytes as f64 / 1024.0
            );
        }
        Ok(())
    }
}

/// Audio sink that discards everything.
#[derive(Debug, Default)]
pub struct Discard;

impl AudioSink for Discard {
    fn play(&mut self, _chunk: &[u8]) -> Result<(), MediaError> {
        Ok(())
    }
}
