//! Configuration model for call setup and media transport.
//!
//! Every component reads its own section. Defaults match the constants the
//! wire protocol and pacing were designed around (5s STUN timeout, 20 probes
//! every 500ms, 1400-byte video fragments, 20ms audio chunks, ...).
//!
//! A [`CallConfig`] can be loaded from a TOML file; any section or key that
//! is omitted keeps its default:
//!
//! ```toml
//! [stun]
//! server = "stun.l.google.com:19302"
//! timeout_ms = 5000
//!
//! [audio]
//! jitter_capacity = 50
//! low_water = 5
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// STUN discovery settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StunConfig {
    // ---
    /// STUN server as `host:port`; resolved on each discovery
    pub server: String,

    /// How long to wait for the Binding Success response
    pub timeout_ms: u64,
}

impl StunConfig {
    // ---
    pub fn timeout(&self) -> Duration {
        // ---
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StunConfig {
    fn default() -> Self {
        // ---
        Self {
            server: "stun.l.google.com:19302".to_string(),
            timeout_ms: 5000,
        }
    }
}

/// Hole-punching probe schedule.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PunchConfig {
    // ---
    /// Delay between probe bursts
    pub interval_ms: u64,

    /// Number of bursts before giving up
    pub attempts: u32,
}

impl PunchConfig {
    // ---
    pub fn interval(&self) -> Duration {
        // ---
        Duration::from_millis(self.interval_ms)
    }

    /// Upper bound on how long a punch can take.
    pub fn budget(&self) -> Duration {
        // ---
        self.interval() * self.attempts
    }
}

impl Default for PunchConfig {
    fn default() -> Self {
        // ---
        Self {
            interval_ms: 500,
            attempts: 20, // ~10s budget
        }
    }
}

/// Rendezvous (pairing) server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    // ---
    /// TCP address the pairing server listens on
    pub bind: String,

    /// How long a participant waits for a partner before receiving `ERROR:`
    pub pair_timeout_ms: u64,
}

impl RendezvousConfig {
    // ---
    pub fn pair_timeout(&self) -> Duration {
        // ---
        Duration::from_millis(self.pair_timeout_ms)
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        // ---
        Self {
            bind: "0.0.0.0:8888".to_string(),
            pair_timeout_ms: 60_000,
        }
    }
}

/// Video send-side settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    // ---
    /// Maximum fragment payload (header excluded)
    pub max_payload: usize,

    /// Capture pacing (~30 fps by default)
    pub frame_interval_ms: u64,
}

impl VideoConfig {
    // ---
    pub fn frame_interval(&self) -> Duration {
        // ---
        Duration::from_millis(self.frame_interval_ms)
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        // ---
        Self {
            max_payload: 1400,
            frame_interval_ms: 33,
        }
    }
}

/// Video receive-side reassembly limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    // ---
    /// Assemblies further than this many frame ids behind the last
    /// delivered frame are purged
    pub retention_window: u32,

    /// Fragments claiming a larger frame are rejected as malformed
    pub max_fragments_per_frame: u32,

    /// Cap on concurrently pending assemblies (oldest evicted first)
    pub max_pending_frames: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        // ---
        Self {
            retention_window: 5,
            max_fragments_per_frame: 1024,
            max_pending_frames: 32,
        }
    }
}

/// Raw PCM audio format and jitter buffer sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    // ---
    /// Samples per second
    pub sample_rate: u32,

    /// Interleaved channel count
    pub channels: u16,

    /// Bytes per sample (2 for 16-bit PCM)
    pub bytes_per_sample: u16,

    /// Duration of one chunk (one datagram)
    pub chunk_ms: u32,

    /// Jitter buffer capacity in chunks
    pub jitter_capacity: usize,

    /// Occupancy required before playback starts draining
    pub low_water: usize,
}

impl AudioConfig {
    // ---
    /// Bytes of one sample frame (all channels of one sampling instant).
    pub fn frame_bytes(&self) -> usize {
        // ---
        self.bytes_per_sample as usize * self.channels as usize
    }

    /// Bytes of one chunk: 640 for 20ms of 16kHz mono 16-bit PCM.
    pub fn chunk_bytes(&self) -> usize {
        // ---
        self.sample_rate as usize * self.frame_bytes() * self.chunk_ms as usize / 1000
    }

    pub fn chunk_duration(&self) -> Duration {
        // ---
        Duration::from_millis(self.chunk_ms as u64)
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        // ---
        Self {
            sample_rate: 16000,
            channels: 1,
            bytes_per_sample: 2,
            chunk_ms: 20,
            jitter_capacity: 50, // ~1s
            low_water: 5,
        }
    }
}

/// Complete configuration of one calling endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    // ---
    pub stun: StunConfig,
    pub punch: PunchConfig,
    pub rendezvous: RendezvousConfig,
    pub video: VideoConfig,
    pub reassembly: ReassemblyConfig,
    pub audio: AudioConfig,
}

impl CallConfig {
    // ---
    /// Parses a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        // ---
        toml::from_str(text).context("invalid call configuration")
    }

    /// Loads a configuration file, or the defaults if `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // ---
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                Self::from_toml(&text)
            }
            None => Ok(Self::default()),
        }
    }
}
