//! Audio send, receive and playback loops.
//!
//! ```text
//!  AudioSource --> send loop --UDP--> receive loop --> JitterBuffer --> playback loop --> AudioSink
//!                 (1 chunk/tick)     (validate size)   (bounded)        (1 chunk/tick)
//! ```

use peercall_common::{AudioConfig, MetricsContext};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::jitter_buffer::JitterBuffer;
use crate::codec::{AudioSink, AudioSource};
use crate::error::MediaError;
use crate::stats::ReceiverStats;
use crate::transport::{recv_or_stop, send_or_stop, Received};

/// Jitter buffer shared by the receive loop (producer) and the playback
/// loop (consumer).
pub type SharedJitterBuffer = Arc<Mutex<JitterBuffer>>;

/// Creates the jitter buffer for a call from its audio format.
pub fn shared_jitter_buffer(config: &AudioConfig) -> SharedJitterBuffer {
    // ---
    Arc::new(Mutex::new(JitterBuffer::new(
        config.jitter_capacity,
        config.low_water,
    )))
}

/// Checks that a datagram holds a whole number of sample frames.
pub fn validate_chunk(datagram: &[u8], frame_bytes: usize) -> Result<(), MediaError> {
    // ---
    if datagram.is_empty() || frame_bytes == 0 || datagram.len() % frame_bytes != 0 {
        return Err(MediaError::MalformedDatagram(format!(
            "{} bytes is not a multiple of the {}-byte sample frame",
            datagram.len(),
            frame_bytes
        )));
    }
    Ok(())
}

/// Reads one chunk per chunk duration from `source` and sends it as a
/// single headerless datagram.
///
/// Reads are trimmed to whole sample frames; a read with no complete frame
/// is skipped. Returns `Ok(())` once the source is exhausted or the stop
/// signal fires.
///
/// # Errors
///
/// Returns [`MediaError::SocketClosed`] if the socket fails while running.
pub async fn audio_send_loop<S: AudioSource>(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut source: S,
    config: AudioConfig,
    metrics: MetricsContext,
    cancel: CancellationToken,
) -> Result<(), MediaError> {
    // ---
    let frame_bytes = config.frame_bytes().max(1);
    let mut buf = vec![0u8; config.chunk_bytes().max(frame_bytes)];
    let mut ticker = tokio::time::interval(config.chunk_duration());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        "Audio send loop started towards {} ({} bytes per {}ms chunk)",
        peer,
        buf.len(),
        config.chunk_ms
    );
    let mut chunks_sent: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let read = match source.read_chunk(&mut buf) {
            Ok(Some(read)) => read.min(buf.len()),
            Ok(None) => {
                info!("Audio source exhausted after {} chunks", chunks_sent);
                break;
            }
            Err(e) => {
                warn!("Skipping audio chunk: {}", e);
                continue;
            }
        };

        let aligned = read - read % frame_bytes;
        if aligned == 0 {
            continue;
        }

        if !send_or_stop(&socket, &buf[..aligned], peer, &cancel).await? {
            break;
        }
        chunks_sent += 1;
        metrics.audio_chunks_sent_total.inc();
        metrics.bytes_sent_total.inc_by(aligned as u64);
    }

    info!("Audio send loop stopped");
    Ok(())
}

/// Validates inbound chunks and queues them for playback.
///
/// # Errors
///
/// Returns [`MediaError::SocketClosed`] if the socket fails while running.
pub async fn audio_receive_loop(
    socket: Arc<UdpSocket>,
    buffer: SharedJitterBuffer,
    config: AudioConfig,
    metrics: MetricsContext,
    cancel: CancellationToken,
) -> Result<(), MediaError> {
    // ---
    let frame_bytes = config.frame_bytes();
    let mut stats = ReceiverStats::new("audio", Duration::from_secs(5));
    let mut buf = vec![0u8; 64 * 1024];

    info!("Audio receive loop started on {}", socket.local_addr()?);

    loop {
        let (len, from) = match recv_or_stop(&socket, &mut buf, &cancel).await? {
            Received::Datagram { len, from } => (len, from),
            Received::Stopped => break,
        };
        stats.record_datagram();
        metrics.bytes_received_total.inc_by(len as u64);

        if let Err(e) = validate_chunk(&buf[..len], frame_bytes) {
            stats.record_malformed();
            metrics.malformed_datagrams_total.inc();
            debug!("Dropping datagram from {}: {}", from, e);
            continue;
        }
        metrics.audio_chunks_received_total.inc();

        let (enqueued, occupancy) = {
            let mut jitter = buffer.lock().unwrap_or_else(PoisonError::into_inner);
            let enqueued = jitter.push(buf[..len].to_vec());
            (enqueued, jitter.len())
        };
        stats.record_chunk(enqueued);
        metrics.jitter_buffer_occupancy_chunks.set(occupancy as i64);
        if !enqueued {
            metrics.audio_chunks_overflow_total.inc();
        }
    }

    stats.log();
    info!("Audio receive loop stopped");
    Ok(())
}

/// Plays at most one chunk per chunk duration from `buffer` into `sink`.
///
/// Nothing is played until the buffer primes; an empty buffer afterwards
/// makes that tick a stall rather than an underrun.
pub async fn playback_loop<K: AudioSink>(
    buffer: SharedJitterBuffer,
    mut sink: K,
    chunk_duration: Duration,
    metrics: MetricsContext,
    cancel: CancellationToken,
) -> Result<(), MediaError> {
    // ---
    let mut ticker = tokio::time::interval(chunk_duration);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut played: u64 = 0;
    let mut stalls: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let (chunk, primed, occupancy) = {
            let mut jitter = buffer.lock().unwrap_or_else(PoisonError::into_inner);
            let chunk = jitter.pop();
            let status = jitter.status();
            (chunk, status.is_primed, status.buffered_chunks)
        };
        metrics.jitter_buffer_occupancy_chunks.set(occupancy as i64);

        match chunk {
            Some(chunk) => {
                played += 1;
                metrics.audio_chunks_played_total.inc();
                if let Err(e) = sink.play(&chunk) {
                    warn!("Audio chunk not played: {}", e);
                }
            }
            None if primed => stalls += 1,
            None => {}
        }
    }

    info!("Playback stopped: {} chunks played, {} stalls", played, stalls);
    Ok(())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::codec::ChannelAudioSink;

    #[test]
    fn test_validate_chunk() {
        // ---
        assert!(validate_chunk(&[0u8; 640], 2).is_ok());
        assert!(validate_chunk(&[0u8; 2], 2).is_ok());
        assert!(validate_chunk(&[0u8; 641], 2).is_err());
        assert!(validate_chunk(&[0u8; 1], 2).is_err());
        assert!(validate_chunk(&[], 2).is_err());
        assert!(validate_chunk(&[0u8; 6], 4).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_paced_one_chunk_per_tick() {
        // ---
        let config = AudioConfig::default();
        let buffer = shared_jitter_buffer(&config);
        {
            let mut jitter = buffer.lock().unwrap();
            for tag in 0..30u8 {
                assert!(jitter.push(vec![tag; 640]));
            }
        }

        let (sink, mut played) = ChannelAudioSink::new();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(playback_loop(
            buffer.clone(),
            sink,
            config.chunk_duration(),
            MetricsContext::new("playback-test").unwrap(),
            cancel.clone(),
        ));

        // Ticks land at 0, 20, 40, 60, 80ms
        tokio::time::sleep(Duration::from_millis(90)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let mut tags = Vec::new();
        while let Ok(chunk) = played.try_recv() {
            tags.push(chunk[0]);
        }
        assert_eq!(tags, vec![0, 1, 2, 3, 4]);
        assert_eq!(buffer.lock().unwrap().len(), 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_waits_for_low_water() {
        // ---
        let config = AudioConfig::default();
        let buffer = shared_jitter_buffer(&config);
        for tag in 0..4u8 {
            buffer.lock().unwrap().push(vec![tag; 640]);
        }

        let (sink, mut played) = ChannelAudioSink::new();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(playback_loop(
            buffer.clone(),
            sink,
            config.chunk_duration(),
            MetricsContext::new("playback-test").unwrap(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(played.try_recv().is_err());

        // Fifth chunk reaches the low-water mark
        buffer.lock().unwrap().push(vec![4; 640]);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(played.try_recv().unwrap()[0], 0);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
