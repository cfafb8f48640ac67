//! Per-stream receive statistics.
//!
//! Receive loops record every datagram outcome here and the totals are
//! logged periodically; Prometheus counters carry the same information
//! process-wide, this is the per-stream view in the logs.

use std::time::{Duration, Instant};
use tracing::info;

/// Reception statistics for one media stream.
#[derive(Debug, Clone)]
pub struct ReceiverStats {
    // ---
    /// Stream label used in log lines ("video", "audio")
    stream: &'static str,

    /// Datagrams read from the socket
    pub datagrams_received: u64,

    /// Datagrams rejected as malformed
    pub datagrams_malformed: u64,

    /// Video frames handed to the sink
    pub frames_delivered: u64,

    /// Video frames discarded (late, purged or evicted)
    pub frames_dropped: u64,

    /// Audio chunks accepted into the jitter buffer
    pub chunks_enqueued: u64,

    /// Audio chunks dropped because the jitter buffer was full
    pub chunks_overflowed: u64,

    start_time: Instant,
    last_log_time: Instant,
    log_interval: Duration,
}

impl ReceiverStats {
    // ---
    /// Creates a new stats tracker.
    ///
    /// # Arguments
    ///
    /// * `stream` - Label for log lines
    /// * `log_interval` - How often to automatically log stats
    pub fn new(stream: &'static str, log_interval: Duration) -> Self {
        // ---
        let now = Instant::now();
        Self {
            stream,
            datagrams_received: 0,
            datagrams_malformed: 0,
            frames_delivered: 0,
            frames_dropped: 0,
            chunks_enqueued: 0,
            chunks_overflowed: 0,
            start_time: now,
            last_log_time: now,
            log_interval,
        }
    }

    pub fn record_datagram(&mut self) {
        // ---
        self.datagrams_received += 1;
        self.maybe_log();
    }

    pub fn record_malformed(&mut self) {
        // ---
        self.datagrams_malformed += 1;
    }

    pub fn record_frame_delivered(&mut self) {
        // ---
        self.frames_delivered += 1;
    }

    pub fn record_frames_dropped(&mut self, count: u64) {
        // ---
        self.frames_dropped += count;
    }

    pub fn record_chunk(&mut self, enqueued: bool) {
        // ---
        if enqueued {
            self.chunks_enqueued += 1;
        } else {
            self.chunks_overflowed += 1;
        }
    }

    /// Share of datagrams rejected as malformed, in percent.
    pub fn malformed_percentage(&self) -> f64 {
        // ---
        if self.datagrams_received == 0 {
            0.0
        } else {
            (self.datagrams_malformed as f64 / self.datagrams_received as f64) * 100.0
        }
    }

    /// Calculates datagrams per second reception rate.
    pub fn datagrams_per_second(&self) -> f64 {
        // ---
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.datagrams_received as f64 / elapsed
        }
    }

    pub fn runtime(&self) -> Duration {
        // ---
        self.start_time.elapsed()
    }

    fn maybe_log(&mut self) {
        // ---
        if self.last_log_time.elapsed() >= self.log_interval {
            self.log();
            self.last_log_time = Instant::now();
        }
    }

    /// Force log current statistics.
    pub fn log(&self) {
        // ---
        info!(
            "RX {} stats: {} dgrams ({:.1}/s), {:.2}% malformed, {} frames shown, {} dropped, {} chunks queued, {} overflowed",
            self.stream,
            self.datagrams_received,
            self.datagrams_per_second(),
            self.malformed_percentage(),
            self.frames_delivered,
            self.frames_dropped,
            self.chunks_enqueued,
            self.chunks_overflowed
        );
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_counts_and_percentage() {
        // ---
        let mut stats = ReceiverStats::new("audio", Duration::from_secs(60));

        for _ in 0..4 {
            stats.record_datagram();
        }
        stats.record_malformed();
        stats.record_chunk(true);
        stats.record_chunk(true);
        stats.record_chunk(false);

        assert_eq!(stats.datagrams_received, 4);
        assert_eq!(stats.chunks_enqueued, 2);
        assert_eq!(stats.chunks_overflowed, 1);
        assert_eq!(stats.malformed_percentage(), 25.0);
    }

    #[test]
    fn test_empty_stats() {
        // ---
        let stats = ReceiverStats::new("video", Duration::from_secs(5));
        assert_eq!(stats.malformed_percentage(), 0.0);
        assert_eq!(stats.frames_delivered, 0);
    }
}
