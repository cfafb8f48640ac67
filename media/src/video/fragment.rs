//! Video fragment wire format.
//!
//! An encoded frame is cut into payloads of at most `max_payload` bytes and
//! each piece travels in its own datagram behind a fixed 12-byte header.
//!
//! # Wire Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           frame id                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        fragment index                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        total fragments                        |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! |                 payload (<= max_payload bytes)                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! All fields are big-endian. Frame ids are 32-bit and wrap from
//! `u32::MAX` to 0; see [`is_newer`] for how the receiver orders them.

use crate::error::MediaError;

/// Size of the fragment header in bytes.
pub const HEADER_LEN: usize = 12;

/// Header carried by every video datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    // ---
    pub frame_id: u32,
    pub index: u32,
    pub total: u32,
}

impl FragmentHeader {
    // ---
    pub fn encode(&self, out: &mut Vec<u8>) {
        // ---
        out.extend_from_slice(&self.frame_id.to_be_bytes());
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.total.to_be_bytes());
    }

    /// Splits a datagram into its header and payload.
    ///
    /// Only the framing is checked here; whether `index`/`total` make sense
    /// is up to the reassembler.
    pub fn parse(datagram: &[u8]) -> Result<(Self, &[u8]), MediaError> {
        // ---
        if datagram.len() < HEADER_LEN {
            return Err(MediaError::MalformedDatagram(format!(
                "{} bytes is shorter than the fragment header",
                datagram.len()
            )));
        }

        let word = |at: usize| {
            u32::from_be_bytes([
                datagram[at],
                datagram[at + 1],
                datagram[at + 2],
                datagram[at + 3],
            ])
        };

        let header = Self {
            frame_id: word(0),
            index: word(4),
            total: word(8),
        };
        Ok((header, &datagram[HEADER_LEN..]))
    }
}

/// `true` if frame id `a` comes after `b`, modulo 2^32.
///
/// Serial-number arithmetic: `a` is newer when it is less than half the id
/// space ahead of `b`. The reassembly window is a handful of ids, so the
/// ambiguous half-way point is never reached in practice.
pub fn is_newer(a: u32, b: u32) -> bool {
    // ---
    let ahead = a.wrapping_sub(b);
    ahead != 0 && ahead < (1 << 31)
}

/// Send-side splitter; owns the frame id counter.
#[derive(Debug, Clone)]
pub struct Fragmenter {
    // ---
    max_payload: usize,
    next_frame_id: u32,
}

impl Fragmenter {
    // ---
    pub fn new(max_payload: usize) -> Self {
        // ---
        Self::starting_at(max_payload, 0)
    }

    /// A zero `max_payload` is treated as 1.
    pub fn starting_at(max_payload: usize, first_frame_id: u32) -> Self {
        // ---
        Self {
            max_payload: max_payload.max(1),
            next_frame_id: first_frame_id,
        }
    }

    /// Cuts one frame into datagrams, in fragment index order.
    ///
    /// Every call consumes a frame id, even for an empty frame (which yields
    /// no datagrams).
    pub fn fragment(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        // ---
        let frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);

        let total = frame.len().div_ceil(self.max_payload) as u32;
        frame
            .chunks(self.max_payload)
            .enumerate()
            .map(|(index, payload)| {
                let mut datagram = Vec::with_capacity(HEADER_LEN + payload.len());
                FragmentHeader {
                    frame_id,
                    index: index as u32,
                    total,
                }
                .encode(&mut datagram);
                datagram.extend_from_slice(payload);
                datagram
            })
            .collect()
    }

    /// Id the next call to [`fragment`](Self::fragment) will use.
    pub fn next_frame_id(&self) -> u32 {
        // ---
        self.next_frame_id
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_header_layout() {
        // ---
        let mut buf = Vec::new();
        FragmentHeader {
            frame_id: 0x01020304,
            index: 2,
            total: 4,
        }
        .encode(&mut buf);

        assert_eq!(buf, vec![1, 2, 3, 4, 0, 0, 0, 2, 0, 0, 0, 4]);
    }

    #[test]
    fn test_parse_splits_payload() {
        // ---
        let mut buf = Vec::new();
        FragmentHeader {
            frame_id: 7,
            index: 0,
            total: 1,
        }
        .encode(&mut buf);
        buf.extend_from_slice(b"abc");

        let (header, payload) = FragmentHeader::parse(&buf).unwrap();
        assert_eq!(header.frame_id, 7);
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn test_short_datagram_is_malformed() {
        // ---
        assert!(matches!(
            FragmentHeader::parse(&[0u8; 11]),
            Err(MediaError::MalformedDatagram(_))
        ));
    }

    #[test]
    fn test_5000_bytes_make_four_fragments() {
        // ---
        let frame = vec![0xAB; 5000];
        let datagrams = Fragmenter::new(1400).fragment(&frame);

        assert_eq!(datagrams.len(), 4);
        let sizes: Vec<usize> = datagrams.iter().map(|d| d.len() - HEADER_LEN).collect();
        assert_eq!(sizes, vec![1400, 1400, 1400, 800]);

        for (i, d) in datagrams.iter().enumerate() {
            let (header, _) = FragmentHeader::parse(d).unwrap();
            assert_eq!(header.index, i as u32);
            assert_eq!(header.total, 4);
        }
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        // ---
        let datagrams = Fragmenter::new(1400).fragment(&vec![1u8; 2800]);
        assert_eq!(datagrams.len(), 2);
    }

    #[test]
    fn test_frame_id_wraps() {
        // ---
        let mut fragmenter = Fragmenter::starting_at(1400, u32::MAX);
        let first = fragmenter.fragment(b"x");
        let second = fragmenter.fragment(b"y");

        assert_eq!(FragmentHeader::parse(&first[0]).unwrap().0.frame_id, u32::MAX);
        assert_eq!(FragmentHeader::parse(&second[0]).unwrap().0.frame_id, 0);
    }

    #[test]
    fn test_is_newer_across_wrap() {
        // ---
        assert!(is_newer(1, 0));
        assert!(is_newer(0, u32::MAX));
        assert!(is_newer(3, u32::MAX - 2));
        assert!(!is_newer(5, 5));
        assert!(!is_newer(u32::MAX, 0));
        assert!(!is_newer(4, 9));
    }
}
