//! Live audio through the system device (cpal, feature `audio-device`).
//!
//! cpal streams are not `Send` on every platform, so each stream lives on
//! its own thread for as long as the collaborator exists. The collaborator
//! itself only holds channel ends and can move into a media task.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use peercall_common::AudioConfig;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use tracing::{debug, info, warn};

use crate::codec::{AudioSink, AudioSource};
use crate::error::MediaError;

fn device_error(e: impl std::fmt::Display) -> MediaError {
    MediaError::CodecFailure(e.to_string())
}

fn stream_config(format: &AudioConfig) -> StreamConfig {
    // ---
    StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Builds a stream on a dedicated thread and keeps it alive until the
/// returned sender is dropped.
fn spawn_stream_thread<F>(name: &str, build: F) -> Result<Sender<()>, MediaError>
where
    F: FnOnce() -> Result<Stream, MediaError> + Send + 'static,
{
    // ---
    let (ready_tx, ready_rx) = mpsc::channel::<Result<(), MediaError>>();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();

    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || match build() {
            Ok(stream) => {
                let _ = ready_tx.send(Ok(()));
                // Returns once the collaborator (and its sender) is dropped
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Audio stream thread exiting");
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        })?;

    ready_rx
        .recv()
        .map_err(|_| device_error("audio stream thread exited during setup"))??;
    Ok(stop_tx)
}

/// Audio sink playing through the default output device.
pub struct DevicePlayback {
    // ---
    sample_tx: Sender<i16>,
    _stop: Sender<()>,
}

impl DevicePlayback {
    // ---
    /// Opens the default output device in the call format.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - No audio output device is available
    /// - Device configuration fails
    /// - Stream creation fails
    pub fn open(format: &AudioConfig) -> Result<Self, MediaError> {
        // ---
        let (sample_tx, sample_rx) = mpsc::channel::<i16>();
        let config = stream_config(format);

        let stop = spawn_stream_thread("audio-playback", move || {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| device_error("no output device available"))?;
            info!("Using output device: {}", device.name().map_err(device_error)?);

            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        // Silence when the jitter buffer has nothing for us
                        for sample in data.iter_mut() {
                            *sample = sample_rx.try_recv().unwrap_or(0);
                        }
                    },
                    |err| warn!("Audio output stream error: {}", err),
                    None,
                )
                .map_err(device_error)?;
            stream.play().map_err(device_error)?;
            Ok(stream)
        })?;

        Ok(Self {
            sample_tx,
            _stop: stop,
        })
    }
}

impl AudioSink for DevicePlayback {
    fn play(&mut self, chunk: &[u8]) -> Result<(), MediaError> {
        // ---
        for pair in chunk.chunks_exact(2) {
            self.sample_tx
                .send(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|_| device_error("audio output thread gone"))?;
        }
        Ok(())
    }
}

/// Audio source capturing from the default input device.
pub struct DeviceCapture {
    // ---
    sample_rx: Receiver<i16>,
    _stop: Sender<()>,
}

impl DeviceCapture {
    // ---
    /// Opens the default input device in the call format.
    pub fn open(format: &AudioConfig) -> Result<Self, MediaError> {
        // ---
        let (sample_tx, sample_rx) = mpsc::channel::<i16>();
        let config = stream_config(format);

        let stop = spawn_stream_thread("audio-capture", move || {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| device_error("no input device available"))?;
            info!("Using input device: {}", device.name().map_err(device_error)?);

            let stream = device
                .build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        for &sample in data {
                            if sample_tx.send(sample).is_err() {
                                break;
                            }
                        }
                    },
                    |err| warn!("Audio input stream error: {}", err),
                    None,
                )
                .map_err(device_error)?;
            stream.play().map_err(device_error)?;
            Ok(stream)
        })?;

        Ok(Self {
            sample_rx,
            _stop: stop,
        })
    }
}

impl AudioSource for DeviceCapture {
    /// Drains whatever the device captured since the last call.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<Option<usize>, MediaError> {
        // ---
        let mut written = 0;
        while written + 2 <= buf.len() {
            match self.sample_rx.try_recv() {
                Ok(sample) => {
                    buf[written..written + 2].copy_from_slice(&sample.to_le_bytes());
                    written += 2;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    return Err(device_error("audio input thread gone"));
                }
            }
        }
        Ok(Some(written))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_playback_open() {
        // ---
        // Requires an audio device; absent in CI and containers
        match DevicePlayback::open(&AudioConfig::default()) {
            Ok(mut player) => player.play(&[0u8; 640]).unwrap(),
            Err(e) => println!("Skipping: no audio device available ({e})"),
        }
    }
}
