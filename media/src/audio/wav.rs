//! WAV file collaborators (hound).
//!
//! [`WavSource`] plays a file into the call, converted to the call's PCM
//! format; [`WavRecorder`] writes the received stream to disk.

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use peercall_common::AudioConfig;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::info;

use crate::codec::{AudioSink, AudioSource};
use crate::error::MediaError;

/// Audio source backed by a WAV file, loaded fully into memory.
///
/// Samples are converted once, at open time, to 16-bit PCM at the call's
/// sample rate and channel count.
#[derive(Debug)]
pub struct WavSource {
    // ---
    /// Interleaved samples in the call format
    samples: Vec<i16>,

    /// Next sample to hand out
    position: usize,

    /// Restart from the beginning when the end is reached
    looping: bool,
}

impl WavSource {
    // ---
    /// Reads and converts a WAV file.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be opened
    /// - WAV format is invalid or not 16-bit int / 32-bit float
    /// - The call format is not 16-bit, or needs more channels than the
    ///   file has
    pub fn open<P: AsRef<Path>>(path: P, format: &AudioConfig) -> Result<Self, MediaError> {
        // ---
        require_16_bit(format)?;
        let path = path.as_ref();
        info!("Reading WAV file: {}", path.display());

        let mut reader = WavReader::open(path)?;
        let spec = reader.spec();
        info!(
            "WAV format: {}Hz, {} channels, {} bits",
            spec.sample_rate, spec.channels, spec.bits_per_sample
        );

        let raw: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Int, 16) => reader.samples::<i16>().collect::<Result<_, _>>()?,
            (SampleFormat::Float, 32) => reader
                .samples::<f32>()
                .map(|s| s.map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
                .collect::<Result<_, _>>()?,
            (format, bits) => {
                return Err(MediaError::CodecFailure(format!(
                    "unsupported WAV sample format {format:?}/{bits}-bit"
                )));
            }
        };

        let samples = convert(&raw, &spec, format)?;
        info!(
            "Loaded {:.2}s of audio",
            samples.len() as f64 / (format.sample_rate as f64 * format.channels as f64)
        );

        Ok(Self::from_samples(samples))
    }

    /// Source over samples already in the call format.
    pub fn from_samples(samples: Vec<i16>) -> Self {
        // ---
        Self {
            samples,
            position: 0,
            looping: false,
        }
    }

    pub fn looping(mut self, looping: bool) -> Self {
        // ---
        self.looping = looping;
        self
    }
}

impl AudioSource for WavSource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<Option<usize>, MediaError> {
        // ---
        if self.position >= self.samples.len() {
            if !self.looping || self.samples.is_empty() {
                return Ok(None);
            }
            self.position = 0;
        }

        let wanted = buf.len() / 2;
        let end = (self.position + wanted).min(self.samples.len());
        let mut written = 0;
        for sample in &self.samples[self.position..end] {
            buf[written..written + 2].copy_from_slice(&sample.to_le_bytes());
            written += 2;
        }
        self.position = end;
        Ok(Some(written))
    }
}

fn require_16_bit(format: &AudioConfig) -> Result<(), MediaError> {
    // ---
    if format.bytes_per_sample != 2 {
        return Err(MediaError::CodecFailure(format!(
            "WAV I/O supports 16-bit PCM only, call uses {} bytes per sample",
            format.bytes_per_sample
        )));
    }
    Ok(())
}

/// Converts to the call's channel count and sample rate.
fn convert(samples: &[i16], spec: &WavSpec, target: &AudioConfig) -> Result<Vec<i16>, MediaError> {
    // ---
    let channels = match (spec.channels, target.channels) {
        (from, to) if from == to => samples.to_vec(),
        (from, 1) => {
            info!("Converting {} channels to mono", from);
            convert_to_mono(samples, from as usize)
        }
        (from, to) => {
            return Err(MediaError::CodecFailure(format!(
                "cannot map {from} WAV channels onto {to} call channels"
            )));
        }
    };

    if spec.sample_rate == target.sample_rate {
        return Ok(channels);
    }
    if target.channels != 1 {
        return Err(MediaError::CodecFailure(format!(
            "resampling {}Hz to {}Hz is only supported for mono",
            spec.sample_rate, target.sample_rate
        )));
    }

    info!("Resampling from {}Hz to {}Hz", spec.sample_rate, target.sample_rate);
    Ok(resample_linear(&channels, spec.sample_rate, target.sample_rate))
}

/// Converts multi-channel audio to mono by averaging channels.
fn convert_to_mono(samples: &[i16], channels: usize) -> Vec<i16> {
    // ---
    samples
        .chunks(channels.max(1))
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

/// Linear interpolation resampler; good enough for voice.
fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    // ---
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let new_len = (samples.len() as f64 / ratio) as usize;
    let last = samples.len() - 1;

    (0..new_len)
        .map(|i| {
            let src_pos = i as f64 * ratio;
            let src_idx = src_pos as usize;
            if src_idx >= last {
                samples[last]
            } else {
                let frac = src_pos - src_idx as f64;
                let s0 = samples[src_idx] as f64;
                let s1 = samples[src_idx + 1] as f64;
                (s0 + (s1 - s0) * frac) as i16
            }
        })
        .collect()
}

/// Audio sink that records the received stream to a WAV file.
///
/// The file header is finalized when the recorder is dropped.
pub struct WavRecorder {
    // ---
    writer: WavWriter<BufWriter<File>>,
    samples_written: u64,
}

impl WavRecorder {
    // ---
    pub fn create<P: AsRef<Path>>(path: P, format: &AudioConfig) -> Result<Self, MediaError> {
        // ---
        require_16_bit(format)?;
        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(path.as_ref(), spec)?;
        info!("Recording received audio to {}", path.as_ref().display());
        Ok(Self {
            writer,
            samples_written: 0,
        })
    }

    pub fn samples_written(&self) -> u64 {
        // ---
        self.samples_written
    }

    /// Flushes and finalizes the WAV header.
    pub fn finish(self) -> Result<(), MediaError> {
        // ---
        self.writer.finalize()?;
        Ok(())
    }
}

impl AudioSink for WavRecorder {
    fn play(&mut self, chunk: &[u8]) -> Result<(), MediaError> {
        // ---
        for pair in chunk.chunks_exact(2) {
            self.writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
            self.samples_written += 1;
        }
        Ok(())
    }
}
