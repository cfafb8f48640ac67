//! Reassembly and jitter buffering under simulated loss and reordering.


use media::audio::{validate_chunk, JitterBuffer};
use media::video::{FrameReassembler, Fragmenter, Ingested, TestPattern};
use media::FrameSource;
use network_simulator::{NetworkSimulator, NetworkSimulatorConfig};
use peercall_common::ReassemblyConfig;
use std::collections::HashMap;

/// Sends `frames` test-pattern frames through `sim` and reassembles them.
///
/// Returns the delivered frame ids, in delivery order, after checking each
/// delivered payload against what was sent.
fn run_video(
    sim: &mut NetworkSimulator,
    reassembler: &mut FrameReassembler,
    frames: u32,
    frame_size: usize,
) -> Vec<u32> {
    // ---
    let mut source = TestPattern::new(frame_size);
    let mut fragmenter = Fragmenter::new(1400);
    let mut sent = HashMap::new();
    let mut delivered = Vec::new();

    for _ in 0..frames {
        let frame = source.next_frame().unwrap().unwrap();
        sent.insert(fragmenter.next_frame_id(), frame.clone());
        for datagram in fragmenter.fragment(&frame) {
            sim.send(datagram);
        }

        // Drain slower than we send so several frames overlap in flight
        for _ in 0..2 {
            if let Some(datagram) = sim.receive() {
                collect(reassembler, &datagram, &sent, &mut delivered);
            }
        }
    }
    for datagram in sim.drain() {
        collect(reassembler, &datagram, &sent, &mut delivered);
    }
    delivered
}

fn collect(
    reassembler: &mut FrameReassembler,
    datagram: &[u8],
    sent: &HashMap<u32, Vec<u8>>,
    delivered: &mut Vec<u32>,
) {
    // ---
    if let Ingested::Frame { frame_id, data } = reassembler.ingest(datagram).unwrap() {
        assert_eq!(&data, &sent[&frame_id], "frame {frame_id} corrupted");
        delivered.push(frame_id);
    }
}

fn assert_strictly_increasing(ids: &[u32]) {
    // ---
    for pair in ids.windows(2) {
        assert!(pair[0] < pair[1], "frame {} delivered after {}", pair[1], pair[0]);
    }
}

/// Tests a clean network delivers every frame once, in order.
#[test]
fn test_perfect_network_delivers_everything() {
    // ---
    let mut sim = NetworkSimulator::new(NetworkSimulatorConfig::default());
    let mut reassembler = FrameReassembler::new(ReassemblyConfig::default());

    let delivered = run_video(&mut sim, &mut reassembler, 100, 5000);

    assert_eq!(delivered, (0..100).collect::<Vec<u32>>());
    assert_eq!(reassembler.pending_len(), 0);
    assert_eq!(reassembler.frames_dropped(), 0);
}

/// Tests loss only ever removes frames, never duplicates or reorders them.
#[test]
fn test_loss_drops_frames_without_duplicates() {
    // ---
    let mut sim = NetworkSimulator::new(NetworkSimulatorConfig {
        loss_rate: 0.1,
        seed: Some(7),
        ..Default::default()
    });
    let config = ReassemblyConfig::default();
    let mut reassembler = FrameReassembler::new(config.clone());

    let delivered = run_video(&mut sim, &mut reassembler, 200, 3000);
    let stats = sim.stats();

    assert!(stats.datagrams_lost > 0);
    assert!(!delivered.is_empty());
    assert!(delivered.len() < 200);
    assert_strictly_increasing(&delivered);
    assert!(reassembler.frames_dropped() > 0);
    assert!(reassembler.pending_len() <= config.max_pending_frames);
}

/// Tests reordering across frames keeps delivery monotonic and memory bounded.
#[test]
fn test_reordering_keeps_delivery_monotonic() {
    // ---
    let mut sim = NetworkSimulator::new(NetworkSimulatorConfig {
        reorder_rate: 0.3,
        seed: Some(42),
        ..Default::default()
    });
    let config = ReassemblyConfig::default();
    let mut reassembler = FrameReassembler::new(config.clone());

    let delivered = run_video(&mut sim, &mut reassembler, 300, 4000);

    assert!(sim.stats().datagrams_reordered > 0);
    assert!(!delivered.is_empty());
    assert_strictly_increasing(&delivered);
    assert!(reassembler.pending_len() <= config.max_pending_frames);

    // Nothing left behind the window of the newest delivered frame
    let newest = reassembler.last_delivered().unwrap();
    for id in 0..newest.saturating_sub(config.retention_window) {
        assert!(!reassembler.is_pending(id), "frame {id} still pending");
    }
}

/// Tests lost or truncated audio datagrams never reach the jitter buffer.
#[test]
fn test_audio_loss_and_truncation() {
    // ---
    let mut sim = NetworkSimulator::new(NetworkSimulatorConfig {
        loss_rate: 0.2,
        seed: Some(3),
        ..Default::default()
    });

    for tag in 0..40u8 {
        let mut chunk = vec![tag; 640];
        // Every tenth chunk arrives cut mid-sample
        if tag % 10 == 9 {
            chunk.truncate(639);
        }
        sim.send(chunk);
    }

    let mut buffer = JitterBuffer::new(50, 5);
    let mut accepted = 0;
    while let Some(datagram) = sim.receive() {
        if validate_chunk(&datagram, 2).is_ok() {
            assert!(buffer.push(datagram));
            accepted += 1;
        }
    }

    assert!(accepted > 0);
    assert!(accepted < 36);
    assert_eq!(buffer.len(), accepted);

    let mut last = None;
    while let Some(chunk) = buffer.pop() {
        assert_eq!(chunk.len(), 640);
        assert_ne!(chunk[0] % 10, 9);
        if let Some(prev) = last {
            assert!(chunk[0] > prev);
        }
        last = Some(chunk[0]);
    }
}
