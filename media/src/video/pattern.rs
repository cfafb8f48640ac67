//! Synthetic video source.
//!
//! Stands in for a camera plus encoder: every frame is an opaque blob of a
//! fixed size whose first eight bytes carry the frame counter, so a viewer
//! can tell frames apart and spot gaps.

use crate::codec::FrameSource;
use crate::error::MediaError;

#[derive(Debug, Clone)]
pub struct TestPattern {
    // ---
    frame_size: usize,
    produced: u64,
    limit: Option<u64>,
}

impl TestPattern {
    // ---
    /// Endless pattern of `frame_size`-byte frames (at least 8 bytes).
    pub fn new(frame_size: usize) -> Self {
        // ---
        Self {
            frame_size: frame_size.max(8),
            produced: 0,
            limit: None,
        }
    }

    /// Stops after `frames` frames.
    pub fn with_limit(mut self, frames: u64) -> Self {
        // ---
        self.limit = Some(frames);
        self
    }

    /// Counter embedded in a frame produced by this source.
    pub fn frame_number(frame: &[u8]) -> Option<u64> {
        // ---
        let head: [u8; 8] = frame.get(..8)?.try_into().ok()?;
        Some(u64::from_be_bytes(head))
    }
}

impl FrameSource for TestPattern {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, MediaError> {
        // ---
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(None);
        }

        let n = self.produced;
        self.produced += 1;

        let mut frame = Vec::with_capacity(self.frame_size);
        frame.extend_from_slice(&n.to_be_bytes());
        // Diagonal gradient that shifts by one each frame
        frame.extend((8..self.frame_size).map(|i| (i as u64 + n) as u8));
        Ok(Some(frame))
    }
}
