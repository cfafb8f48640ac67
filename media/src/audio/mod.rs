//! Audio transport: raw PCM chunks, jitter buffer and playback pacing.

#[cfg(feature = "audio-device")]
pub mod device;
pub mod jitter_buffer;
pub mod stream;
pub mod tone;
pub mod wav;

#[cfg(feature = "audio-device")]
pub use device::{DeviceCapture, DevicePlayback};
pub use jitter_buffer::{JitterBuffer, JitterBufferStatus};
pub use stream::{
    audio_receive_loop, audio_send_loop, playback_loop, shared_jitter_buffer, validate_chunk,
    SharedJitterBuffer,
};
pub use tone::ToneSource;
pub use wav::{WavRecorder, WavSource};
