//! Per-sender sequence tracking and hub-wide packet diagnostics.
//!
//! Every received frame passes through [`SequenceTracker::record`]; the
//! outcome tells the receive path whether the frame is in order, late, or
//! follows a gap (the FEC hint for the decoder). Duplicates are counted
//! and still passed through - higher layers dedupe or accept.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use crate::packet::DeviceId;
use crate::utils::now_millis;

/// Outcome of recording one sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqOutcome {
    /// Exactly last + 1 (or the first frame seen from this sender).
    InOrder,
    /// Skipped ahead; carries the number of missing frames.
    Gap(u32),
    /// At or behind the last seen sequence.
    Duplicate,
}

/// Snapshot of one sender's counters.
#[derive(Debug, Clone, Serialize)]
pub struct SenderStats {
    pub seq_min: u32,
    pub seq_max: u32,
    pub packet_count: u64,
    pub gaps: u64,
    pub duplicates: u64,
    pub last_seen: u64,
}

#[derive(Debug)]
struct SenderState {
    seq_min: u32,
    seq_max: u32,
    last_seq: u32,
    packet_count: u64,
    gaps: u64,
    duplicates: u64,
    last_seen: u64,
}

/// Hub-wide packet diagnostics: per-sender monotonicity plus TX counters.
#[derive(Default)]
pub struct SequenceTracker {
    senders: DashMap<DeviceId, SenderState>,
    tx_packets: AtomicU64,
    tx_errors: AtomicU64,
    priority_clamped: AtomicU64,
    decode_errors: AtomicU64,
    malformed: AtomicU64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a received sequence number for a sender.
    pub fn record(&self, device: DeviceId, seq: u32) -> SeqOutcome {
        let now = now_millis();
        let mut entry = self.senders.entry(device).or_insert_with(|| SenderState {
            seq_min: seq,
            seq_max: seq,
            last_seq: seq,
            packet_count: 0,
            gaps: 0,
            duplicates: 0,
            last_seen: now,
        });

        entry.packet_count += 1;
        entry.last_seen = now;

        if entry.packet_count == 1 {
            return SeqOutcome::InOrder;
        }

        entry.seq_min = entry.seq_min.min(seq);
        entry.seq_max = entry.seq_max.max(seq);

        let outcome = if seq == entry.last_seq.wrapping_add(1) {
            SeqOutcome::InOrder
        } else if seq > entry.last_seq {
            let missing = seq - entry.last_seq - 1;
            entry.gaps += missing as u64;
            SeqOutcome::Gap(missing)
        } else {
            entry.duplicates += 1;
            SeqOutcome::Duplicate
        };

        if seq > entry.last_seq {
            entry.last_seq = seq;
        }
        outcome
    }

    /// Counts one emitted packet.
    pub fn record_tx(&self) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one failed emission.
    pub fn record_tx_error(&self) {
        self.tx_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a clamped wire priority byte.
    pub fn record_priority_clamped(&self) {
        self.priority_clamped.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a decode error absorbed as silence.
    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a dropped malformed packet.
    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Per-sender snapshot, keyed by hex device id.
    pub fn snapshot(&self) -> Vec<(String, SenderStats)> {
        self.senders
            .iter()
            .map(|e| {
                (
                    e.key().to_string(),
                    SenderStats {
                        seq_min: e.seq_min,
                        seq_max: e.seq_max,
                        packet_count: e.packet_count,
                        gaps: e.gaps,
                        duplicates: e.duplicates,
                        last_seen: e.last_seen,
                    },
                )
            })
            .collect()
    }

    /// Hub TX and diagnostic counters.
    pub fn tx_snapshot(&self) -> TxStats {
        TxStats {
            packets: self.tx_packets.load(Ordering::Relaxed),
            errors: self.tx_errors.load(Ordering::Relaxed),
            priority_clamped: self.priority_clamped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }

    /// Resets all counters and forgets all senders.
    pub fn reset(&self) {
        self.senders.clear();
        self.tx_packets.store(0, Ordering::Relaxed);
        self.tx_errors.store(0, Ordering::Relaxed);
        self.priority_clamped.store(0, Ordering::Relaxed);
        self.decode_errors.store(0, Ordering::Relaxed);
        self.malformed.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of the hub's emission counters.
#[derive(Debug, Clone, Serialize)]
pub struct TxStats {
    pub packets: u64,
    pub errors: u64,
    pub priority_clamped: u64,
    pub decode_errors: u64,
    pub malformed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(n: u8) -> DeviceId {
        DeviceId([n, 0, 0, 0, 0, 0, 0, 0])
    }

    #[test]
    fn in_order_sequences_count_cleanly() {
        let tracker = SequenceTracker::new();
        for seq in 10..110 {
            assert_eq!(tracker.record(dev(1), seq), SeqOutcome::InOrder);
        }
        let snap = tracker.snapshot();
        let (_, stats) = snap.iter().find(|(id, _)| id == &dev(1).to_string()).unwrap();
        assert_eq!(stats.packet_count, 100);
        assert_eq!(stats.gaps, 0);
        assert_eq!(stats.duplicates, 0);
        assert_eq!(stats.seq_min, 10);
        assert_eq!(stats.seq_max, 109);
    }

    #[test]
    fn gaps_count_missing_frames() {
        let tracker = SequenceTracker::new();
        tracker.record(dev(1), 1);
        tracker.record(dev(1), 2);
        assert_eq!(tracker.record(dev(1), 6), SeqOutcome::Gap(3));
        let snap = tracker.snapshot();
        assert_eq!(snap[0].1.gaps, 3);
    }

    #[test]
    fn duplicates_are_counted_never_hidden() {
        let tracker = SequenceTracker::new();
        tracker.record(dev(1), 5);
        tracker.record(dev(1), 6);
        assert_eq!(tracker.record(dev(1), 6), SeqOutcome::Duplicate);
        assert_eq!(tracker.record(dev(1), 3), SeqOutcome::Duplicate);
        let snap = tracker.snapshot();
        assert_eq!(snap[0].1.duplicates, 2);
        // Duplicate frames still count as received packets.
        assert_eq!(snap[0].1.packet_count, 4);
    }

    #[test]
    fn senders_are_tracked_independently() {
        let tracker = SequenceTracker::new();
        tracker.record(dev(1), 1);
        tracker.record(dev(2), 100);
        tracker.record(dev(1), 3);
        tracker.record(dev(2), 101);
        let snap = tracker.snapshot();
        let a = &snap.iter().find(|(id, _)| id == &dev(1).to_string()).unwrap().1;
        let b = &snap.iter().find(|(id, _)| id == &dev(2).to_string()).unwrap().1;
        assert_eq!(a.gaps, 1);
        assert_eq!(b.gaps, 0);
    }

    #[test]
    fn reset_clears_everything() {
        let tracker = SequenceTracker::new();
        tracker.record(dev(1), 1);
        tracker.record_tx();
        tracker.record_tx_error();
        tracker.record_priority_clamped();
        tracker.reset();
        assert!(tracker.snapshot().is_empty());
        let tx = tracker.tx_snapshot();
        assert_eq!(tx.packets, 0);
        assert_eq!(tx.errors, 0);
        assert_eq!(tx.priority_clamped, 0);
    }
}
