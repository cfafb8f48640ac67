//! The four media tasks of a call, started and stopped as one unit.

use peercall_common::{CallConfig, MetricsContext};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::audio::{audio_receive_loop, audio_send_loop, playback_loop, shared_jitter_buffer};
use crate::codec::{AudioSink, AudioSource, FrameSink, FrameSource};
use crate::error::MediaError;
use crate::video::{video_receive_loop, video_send_loop};

/// Punched sockets and the peer endpoints they answer to.
///
/// Each socket is shared by exactly one send and one receive task.
#[derive(Debug, Clone)]
pub struct MediaLinks {
    // ---
    pub video_socket: Arc<UdpSocket>,
    pub video_peer: SocketAddr,
    pub audio_socket: Arc<UdpSocket>,
    pub audio_peer: SocketAddr,
}

/// Capture, codec and presentation collaborators for one call.
pub struct MediaDevices {
    // ---
    pub frame_source: Box<dyn FrameSource>,
    pub frame_sink: Box<dyn FrameSink>,
    pub audio_source: Box<dyn AudioSource>,
    pub audio_sink: Box<dyn AudioSink>,
}

type TaskHandle = JoinHandle<Result<(), MediaError>>;

/// Running media tasks of one call.
///
/// A task that fails raises the shared stop token, which takes the other
/// tasks down with it; [`MediaTasks::stop`] then reports the failure.
pub struct MediaTasks {
    // ---
    cancel: CancellationToken,
    tasks: Vec<(&'static str, TaskHandle)>,
}

impl MediaTasks {
    // ---
    /// Spawns video send/receive, audio send/receive and audio playback.
    ///
    /// `cancel` stops all of them; it is also raised by a failing task.
    pub fn spawn(
        links: MediaLinks,
        devices: MediaDevices,
        config: &CallConfig,
        metrics: &MetricsContext,
        cancel: CancellationToken,
    ) -> Self {
        // ---
        let MediaDevices {
            frame_source,
            frame_sink,
            audio_source,
            audio_sink,
        } = devices;
        let jitter = shared_jitter_buffer(&config.audio);

        let tasks = vec![
            supervise(
                "video-send",
                &cancel,
                video_send_loop(
                    links.video_socket.clone(),
                    links.video_peer,
                    frame_source,
                    config.video.clone(),
                    metrics.clone(),
                    cancel.clone(),
                ),
            ),
            supervise(
                "video-receive",
                &cancel,
                video_receive_loop(
                    links.video_socket,
                    frame_sink,
                    config.reassembly.clone(),
                    metrics.clone(),
                    cancel.clone(),
                ),
            ),
            supervise(
                "audio-send",
                &cancel,
                audio_send_loop(
                    links.audio_socket.clone(),
                    links.audio_peer,
                    audio_source,
                    config.audio.clone(),
                    metrics.clone(),
                    cancel.clone(),
                ),
            ),
            supervise(
                "audio-receive",
                &cancel,
                audio_receive_loop(
                    links.audio_socket,
                    jitter.clone(),
                    config.audio.clone(),
                    metrics.clone(),
                    cancel.clone(),
                ),
            ),
            supervise(
                "audio-playback",
                &cancel,
                playback_loop(
                    jitter,
                    audio_sink,
                    config.audio.chunk_duration(),
                    metrics.clone(),
                    cancel.clone(),
                ),
            ),
        ];

        info!("Media started (video -> {}, audio -> {})", links.video_peer, links.audio_peer);
        Self { cancel, tasks }
    }

    /// Token raised when the tasks stop, whether asked to or by failure.
    pub fn stopped(&self) -> &CancellationToken {
        // ---
        &self.cancel
    }

    /// Stops every task and waits for all of them.
    ///
    /// Returns the first task error, if any task failed.
    pub async fn stop(self) -> Result<(), MediaError> {
        // ---
        self.cancel.cancel();

        let mut first_error = None;
        for (name, handle) in self.tasks {
            match handle.await {
                Ok(Ok(())) => debug!("{} task joined", name),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(join) => error!("{} task panicked or was aborted: {}", name, join),
            }
        }

        info!("Media stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn supervise<F>(name: &'static str, cancel: &CancellationToken, task: F) -> (&'static str, TaskHandle)
where
    F: Future<Output = Result<(), MediaError>> + Send + 'static,
{
    // ---
    let cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        let result = task.await;
        if let Err(e) = &result {
            if !cancel.is_cancelled() {
                error!("{} task failed: {}", name, e);
                cancel.cancel();
            }
        }
        result
    });
    (name, handle)
}
