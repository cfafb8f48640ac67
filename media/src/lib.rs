//! Media transport for peer-to-peer calls.
//!
//! Video frames are fragmented into bounded datagrams and reassembled on
//! arrival; audio travels as fixed-size raw PCM chunks smoothed by a jitter
//! buffer. Neither stream has retransmission or congestion control: loss
//! is absorbed by dropping frames or chunks.
//!
//! Codecs, capture devices and displays are collaborators behind the traits
//! in [`codec`]; the media tasks only move their bytes.

pub mod audio;
pub mod codec;
pub mod error;
pub mod stats;
pub mod tasks;
mod transport;
pub mod video;

pub use codec::{
    AudioSink, AudioSource, ChannelAudioSink, ChannelFrameSink, Discard, FrameCounter, FrameSink,
    FrameSource, QueuedFrames,
};
pub use error::MediaError;
pub use stats::ReceiverStats;
pub use tasks::{MediaDevices, MediaLinks, MediaTasks};
