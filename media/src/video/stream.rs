//! Video send and receive loops.

use peercall_common::{MetricsContext, ReassemblyConfig, VideoConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fragment::Fragmenter;
use super::reassembly::{FrameReassembler, Ingested};
use crate::codec::{FrameSink, FrameSource};
use crate::error::MediaError;
use crate::stats::ReceiverStats;
use crate::transport::{recv_or_stop, send_or_stop, Received};

/// Largest datagram the receive loop reads.
const RECV_BUF: usize = 64 * 1024;

/// Pulls frames from `source` at the configured frame rate and sends each
/// one as a burst of fragments, in index order.
///
/// Returns `Ok(())` when the source is exhausted or the stop signal fires.
///
/// # Errors
///
/// Returns [`MediaError::SocketClosed`] if the socket fails while running.
pub async fn video_send_loop<S: FrameSource>(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut source: S,
    config: VideoConfig,
    metrics: MetricsContext,
    cancel: CancellationToken,
) -> Result<(), MediaError> {
    // ---
    let mut fragmenter = Fragmenter::new(config.max_payload);
    let mut ticker = tokio::time::interval(config.frame_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("Video send loop started towards {}", peer);
    let mut frames_sent: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Video source exhausted after {} frames", frames_sent);
                break;
            }
            Err(e) => {
                warn!("Skipping frame: {}", e);
                continue;
            }
        };

        for datagram in fragmenter.fragment(&frame) {
            if !send_or_stop(&socket, &datagram, peer, &cancel).await? {
                return Ok(());
            }
            metrics.video_fragments_sent_total.inc();
            metrics.bytes_sent_total.inc_by(datagram.len() as u64);
        }

        frames_sent += 1;
        if frames_sent.is_multiple_of(100) {
            debug!("Sent {} frames, next id {}", frames_sent, fragmenter.next_frame_id());
        }
    }

    info!("Video send loop stopped");
    Ok(())
}

/// Reassembles fragments from `socket` and presents complete frames.
///
/// Malformed datagrams and sink failures are logged and skipped.
///
/// # Errors
///
/// Returns [`MediaError::SocketClosed`] if the socket fails while running.
pub async fn video_receive_loop<K: FrameSink>(
    socket: Arc<UdpSocket>,
    mut sink: K,
    config: ReassemblyConfig,
    metrics: MetricsContext,
    cancel: CancellationToken,
) -> Result<(), MediaError> {
    // ---
    let mut reassembler = FrameReassembler::new(config);
    let mut stats = ReceiverStats::new("video", Duration::from_secs(5));
    let mut buf = vec![0u8; RECV_BUF];

    info!("Video receive loop started on {}", socket.local_addr()?);

    loop {
        let (len, from) = match recv_or_stop(&socket, &mut buf, &cancel).await? {
            Received::Datagram { len, from } => (len, from),
            Received::Stopped => break,
        };
        stats.record_datagram();
        metrics.video_fragments_received_total.inc();
        metrics.bytes_received_total.inc_by(len as u64);

        let dropped_before = reassembler.frames_dropped();
        let outcome = reassembler.ingest(&buf[..len]);
        let newly_dropped = reassembler.frames_dropped() - dropped_before;
        if newly_dropped > 0 {
            stats.record_frames_dropped(newly_dropped);
            metrics.video_frames_dropped_total.inc_by(newly_dropped);
        }
        metrics
            .video_pending_assemblies
            .set(reassembler.pending_len() as i64);

        match outcome {
            Ok(Ingested::Frame { frame_id, data }) => {
                stats.record_frame_delivered();
                metrics.video_frames_delivered_total.inc();
                if let Err(e) = sink.present(&data) {
                    warn!("Frame {} not shown: {}", frame_id, e);
                }
            }
            Ok(Ingested::Late { frame_id }) => {
                debug!("Late fragment for frame {} from {}", frame_id, from);
            }
            Ok(Ingested::Pending) | Ok(Ingested::Duplicate) => {}
            Err(e) => {
                stats.record_malformed();
                metrics.malformed_datagrams_total.inc();
                debug!("Dropping {} byte datagram from {}: {}", len, from, e);
            }
        }
    }

    stats.log();
    info!("Video receive loop stopped");
    Ok(())
}
