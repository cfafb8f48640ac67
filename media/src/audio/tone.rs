//! Sine tone generator, for calls without a microphone or input file.

use peercall_common::AudioConfig;
use std::f64::consts::TAU;

use crate::codec::AudioSource;
use crate::error::MediaError;

#[derive(Debug, Clone)]
pub struct ToneSource {
    // ---
    frequency: f64,
    amplitude: f64,
    sample_rate: f64,
    channels: usize,
    phase: f64,
}

impl ToneSource {
    // ---
    /// Endless tone at `frequency` Hz, at a quarter of full scale.
    pub fn new(frequency: f64, format: &AudioConfig) -> Self {
        // ---
        Self {
            frequency,
            amplitude: i16::MAX as f64 / 4.0,
            sample_rate: format.sample_rate.max(1) as f64,
            channels: format.channels.max(1) as usize,
            phase: 0.0,
        }
    }
}

impl AudioSource for ToneSource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<Option<usize>, MediaError> {
        // ---
        let frame_bytes = 2 * self.channels;
        let frames = buf.len() / frame_bytes;
        let step = TAU * self.frequency / self.sample_rate;

        for frame in buf.chunks_exact_mut(frame_bytes).take(frames) {
            let sample = (self.phase.sin() * self.amplitude) as i16;
            for out in frame.chunks_exact_mut(2) {
                out.copy_from_slice(&sample.to_le_bytes());
            }
            self.phase = (self.phase + step) % TAU;
        }
        Ok(Some(frames * frame_bytes))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_fills_whole_frames_only() {
        // ---
        let mut tone = ToneSource::new(440.0, &AudioConfig::default());
        let mut buf = [0u8; 641];

        assert_eq!(tone.read_chunk(&mut buf).unwrap(), Some(640));
    }

    #[test]
    fn test_signal_is_not_silent() {
        // ---
        let mut tone = ToneSource::new(440.0, &AudioConfig::default());
        let mut buf = [0u8; 640];
        tone.read_chunk(&mut buf).unwrap();

        assert!(buf.chunks_exact(2).any(|s| i16::from_le_bytes([s[0], s[1]]) != 0));
    }
}
