//! Jitter buffer for raw PCM chunks.
//!
//! A bounded FIFO between the audio receive loop and the playback loop.
//! Chunks carry no sequence numbers, so there is nothing to reorder: the
//! buffer only absorbs arrival jitter by holding a few chunks before
//! playback starts.
//!
//! # Policy
//!
//! - **Priming**: nothing is released until occupancy reaches the low-water
//!   mark. After that the buffer stays primed for the rest of the call, and
//!   running dry just means the next pull returns `None`.
//! - **Overflow**: a chunk arriving at a full buffer is dropped (newest
//!   loses). Queued audio is never evicted.

use std::collections::VecDeque;
use tracing::debug;

/// Bounded FIFO of audio chunks.
///
/// # Example
///
/// ```
/// use media::audio::JitterBuffer;
///
/// let mut buffer = JitterBuffer::new(50, 2);
/// buffer.push(vec![0u8; 640]);
/// assert!(buffer.pop().is_none()); // still priming
///
/// buffer.push(vec![1u8; 640]);
/// assert_eq!(buffer.pop().unwrap()[0], 0);
/// ```
#[derive(Debug)]
pub struct JitterBuffer {
    // ---
    /// Maximum chunks held
    capacity: usize,

    /// Occupancy that starts playback
    low_water: usize,

    chunks: VecDeque<Vec<u8>>,

    /// Whether the low-water mark has been reached once
    is_primed: bool,
}

impl JitterBuffer {
    // ---
    /// Creates an empty buffer.
    ///
    /// `capacity` is at least 1 and `low_water` is clamped to it.
    pub fn new(capacity: usize, low_water: usize) -> Self {
        // ---
        let capacity = capacity.max(1);
        Self {
            capacity,
            low_water: low_water.min(capacity),
            chunks: VecDeque::with_capacity(capacity),
            is_primed: false,
        }
    }

    /// Appends a chunk.
    ///
    /// Returns `false` if the buffer was full and the chunk was dropped.
    pub fn push(&mut self, chunk: Vec<u8>) -> bool {
        // ---
        if self.chunks.len() >= self.capacity {
            debug!("Jitter buffer full ({}), dropping newest chunk", self.capacity);
            return false;
        }
        self.chunks.push_back(chunk);
        true
    }

    /// Takes the oldest chunk for playback.
    ///
    /// Returns `None` while priming or when the buffer has run dry.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        // ---
        if !self.is_primed {
            if self.chunks.len() < self.low_water {
                return None;
            }
            self.is_primed = true;
            debug!("Jitter buffer primed at {} chunks", self.chunks.len());
        }
        self.chunks.pop_front()
    }

    pub fn len(&self) -> usize {
        // ---
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.chunks.is_empty()
    }

    /// Returns current buffer status for debugging.
    pub fn status(&self) -> JitterBufferStatus {
        // ---
        JitterBufferStatus {
            buffered_chunks: self.chunks.len(),
            capacity: self.capacity,
            is_primed: self.is_primed,
        }
    }
}

/// Jitter buffer status for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitterBufferStatus {
    pub buffered_chunks: usize,
    pub capacity: usize,
    pub is_primed: bool,
}
