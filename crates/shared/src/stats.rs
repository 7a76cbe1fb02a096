//! Per-connection counters.
//!
//! A single writer (the backend's worker task) bumps these once per data
//! frame, on its first transmission and on first receipt; any number of
//! readers snapshot them concurrently. Retransmits, acks and keepalives are
//! transport bookkeeping and stay out of the counters, so a retried frame is
//! never counted twice.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ConnectionStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    rtt_micros: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub rtt_micros: u64,
    /// UTC microseconds at capture time.
    pub captured_at_micros: i64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_receive(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rtt(&self, micros: u64) {
        self.rtt_micros.store(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            rtt_micros: self.rtt_micros.load(Ordering::Relaxed),
            captured_at_micros: crate::now_micros(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_once_per_physical_transfer() {
        let stats = ConnectionStats::new();
        stats.record_send(100);
        stats.record_send(50);
        stats.record_receive(25);
        stats.record_rtt(1_500);

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_received, 25);
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.rtt_micros, 1_500);
        assert!(snap.captured_at_micros > 0);
    }
}
