//! Receive-side frame reassembly.
//!
//! Fragments are grouped per frame id. A frame is handed out exactly once,
//! when its last missing fragment arrives, and only if it is newer than the
//! last frame handed out. There is no retransmission: frames that stay
//! incomplete are eventually purged and never shown.
//!
//! Memory is bounded twice over:
//! - assemblies more than `retention_window` ids behind the last delivered
//!   frame are purged after every delivery
//! - at most `max_pending_frames` assemblies exist; the oldest (by first
//!   arrival) is evicted to make room

use peercall_common::ReassemblyConfig;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

use super::fragment::{is_newer, FragmentHeader};
use crate::error::MediaError;

/// Partially received frame.
#[derive(Debug)]
pub struct FrameAssembly {
    // ---
    pub frame_id: u32,
    pub total_fragments: u32,
    received: HashMap<u32, Vec<u8>>,
    pub first_seen_at: Instant,
}

impl FrameAssembly {
    // ---
    fn new(frame_id: u32, total_fragments: u32, now: Instant) -> Self {
        // ---
        Self {
            frame_id,
            total_fragments,
            received: HashMap::new(),
            first_seen_at: now,
        }
    }

    pub fn received_fragments(&self) -> usize {
        // ---
        self.received.len()
    }

    pub fn is_complete(&self) -> bool {
        // ---
        self.received.len() == self.total_fragments as usize
    }

    /// Concatenates fragments in index order. Only valid once complete.
    fn into_frame(mut self) -> Vec<u8> {
        // ---
        let size = self.received.values().map(Vec::len).sum();
        let mut frame = Vec::with_capacity(size);
        for index in 0..self.total_fragments {
            if let Some(part) = self.received.remove(&index) {
                frame.extend_from_slice(&part);
            }
        }
        frame
    }
}

/// What became of one fragment.
#[derive(Debug, PartialEq, Eq)]
pub enum Ingested {
    // ---
    /// Stored; its frame is still missing fragments
    Pending,

    /// Completed a frame that is due for display
    Frame { frame_id: u32, data: Vec<u8> },

    /// Same index already held for this frame
    Duplicate,

    /// Belongs to a frame not newer than the last delivered one
    Late { frame_id: u32 },
}

/// Fragment-to-frame reassembler.
///
/// Owned by a single receive loop; no internal locking.
///
/// # Example
///
/// ```
/// use media::video::{Fragmenter, FrameReassembler, Ingested};
/// use peercall_common::ReassemblyConfig;
///
/// let mut fragmenter = Fragmenter::new(1400);
/// let mut reassembler = FrameReassembler::new(ReassemblyConfig::default());
///
/// let frame = vec![7u8; 3000];
/// let mut delivered = None;
/// for datagram in fragmenter.fragment(&frame).iter().rev() {
///     if let Ok(Ingested::Frame { data, .. }) = reassembler.ingest(datagram) {
///         delivered = Some(data);
///     }
/// }
/// assert_eq!(delivered, Some(frame));
/// ```
pub struct FrameReassembler {
    // ---
    config: ReassemblyConfig,
    pending: HashMap<u32, FrameAssembly>,
    last_delivered: Option<u32>,

    /// Assemblies discarded without delivery (purged or evicted)
    dropped: u64,
}

impl FrameReassembler {
    // ---
    pub fn new(config: ReassemblyConfig) -> Self {
        // ---
        Self {
            config,
            pending: HashMap::new(),
            last_delivered: None,
            dropped: 0,
        }
    }

    /// Feeds one datagram, timestamped now.
    pub fn ingest(&mut self, datagram: &[u8]) -> Result<Ingested, MediaError> {
        // ---
        self.ingest_at(datagram, Instant::now())
    }

    /// Feeds one datagram received at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::MalformedDatagram`] if:
    /// - the datagram is shorter than the header
    /// - `total` is zero or above `max_fragments_per_frame`
    /// - `index` is not below `total`
    /// - `total` disagrees with earlier fragments of the same frame
    pub fn ingest_at(&mut self, datagram: &[u8], now: Instant) -> Result<Ingested, MediaError> {
        // ---
        let (header, payload) = FragmentHeader::parse(datagram)?;
        self.validate(&header)?;

        let FragmentHeader {
            frame_id,
            index,
            total,
        } = header;

        if let Some(last) = self.last_delivered {
            if !is_newer(frame_id, last) {
                return Ok(Ingested::Late { frame_id });
            }
        }

        if !self.pending.contains_key(&frame_id) {
            self.make_room();
            self.pending
                .insert(frame_id, FrameAssembly::new(frame_id, total, now));
        }

        let Some(assembly) = self.pending.get_mut(&frame_id) else {
            return Ok(Ingested::Pending);
        };

        if assembly.total_fragments != total {
            return Err(MediaError::MalformedDatagram(format!(
                "frame {frame_id} announced {} fragments, now {total}",
                assembly.total_fragments
            )));
        }

        if assembly.received.contains_key(&index) {
            return Ok(Ingested::Duplicate);
        }
        assembly.received.insert(index, payload.to_vec());

        if !assembly.is_complete() {
            return Ok(Ingested::Pending);
        }

        let Some(assembly) = self.pending.remove(&frame_id) else {
            return Ok(Ingested::Pending);
        };
        self.last_delivered = Some(frame_id);
        self.purge_stale(frame_id);

        Ok(Ingested::Frame {
            frame_id,
            data: assembly.into_frame(),
        })
    }

    fn validate(&self, header: &FragmentHeader) -> Result<(), MediaError> {
        // ---
        if header.total == 0 {
            return Err(MediaError::MalformedDatagram(format!(
                "frame {} has zero fragments",
                header.frame_id
            )));
        }
        if header.total > self.config.max_fragments_per_frame {
            return Err(MediaError::MalformedDatagram(format!(
                "frame {} claims {} fragments (limit {})",
                header.frame_id, header.total, self.config.max_fragments_per_frame
            )));
        }
        if header.index >= header.total {
            return Err(MediaError::MalformedDatagram(format!(
                "fragment {} of {} for frame {}",
                header.index, header.total, header.frame_id
            )));
        }
        Ok(())
    }

    /// Drops assemblies further than the retention window behind `newest`.
    fn purge_stale(&mut self, newest: u32) {
        // ---
        let window = self.config.retention_window;
        let before = self.pending.len();
        self.pending
            .retain(|&id, _| is_newer(id, newest) || newest.wrapping_sub(id) <= window);

        let purged = before - self.pending.len();
        if purged > 0 {
            debug!("Purged {} stale frame assemblies behind {}", purged, newest);
            self.dropped += purged as u64;
        }
    }

    /// Evicts the oldest assembly while at the pending cap.
    fn make_room(&mut self) {
        // ---
        while self.pending.len() >= self.config.max_pending_frames.max(1) {
            let oldest = self
                .pending
                .values()
                .min_by_key(|a| a.first_seen_at)
                .map(|a| a.frame_id);
            match oldest {
                Some(id) => {
                    debug!("Evicting incomplete frame {} (pending cap)", id);
                    self.pending.remove(&id);
                    self.dropped += 1;
                }
                None => break,
            }
        }
    }

    pub fn last_delivered(&self) -> Option<u32> {
        // ---
        self.last_delivered
    }

    pub fn pending_len(&self) -> usize {
        // ---
        self.pending.len()
    }

    pub fn is_pending(&self, frame_id: u32) -> bool {
        // ---
        self.pending.contains_key(&frame_id)
    }

    /// Total assemblies discarded without delivery.
    pub fn frames_dropped(&self) -> u64 {
        // ---
        self.dropped
    }
}
