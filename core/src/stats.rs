// Traffic accounting — session counters kept lock-free

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for one membership session.
///
/// Only user traffic is recorded; control messages never reach these. The
/// counters are read from application tasks while the receive path updates
/// them, so they are atomics. Relaxed ordering is enough; they are
/// statistics, not synchronization.
#[derive(Debug, Default)]
pub struct TrafficStats {
    messages_rx: AtomicU64,
    messages_tx: AtomicU64,
    bytes_rx: AtomicU64,
    bytes_tx: AtomicU64,
    hop_sum_rx: AtomicU64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// One user message handed to the transport.
    pub fn record_sent(&self, payload_bytes: usize) {
        self.messages_tx.fetch_add(1, Ordering::Relaxed);
        self.bytes_tx.fetch_add(payload_bytes as u64, Ordering::Relaxed);
    }

    /// One user message delivered to the application.
    pub fn record_received(&self, payload_bytes: usize) {
        self.messages_rx.fetch_add(1, Ordering::Relaxed);
        self.bytes_rx.fetch_add(payload_bytes as u64, Ordering::Relaxed);
    }

    /// Hops traveled by a delivered user message.
    pub fn record_hops(&self, hops: u64) {
        self.hop_sum_rx.fetch_add(hops, Ordering::Relaxed);
    }

    /// Zero everything. Runs on a fresh join; counters span one session.
    pub fn reset(&self) {
        self.messages_rx.store(0, Ordering::Relaxed);
        self.messages_tx.store(0, Ordering::Relaxed);
        self.bytes_rx.store(0, Ordering::Relaxed);
        self.bytes_tx.store(0, Ordering::Relaxed);
        self.hop_sum_rx.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            messages_rx: self.messages_rx.load(Ordering::Relaxed),
            messages_tx: self.messages_tx.load(Ordering::Relaxed),
            bytes_rx: self.bytes_rx.load(Ordering::Relaxed),
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            hop_count_sum: self.hop_sum_rx.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrafficSnapshot {
    pub messages_rx: u64,
    pub messages_tx: u64,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub hop_count_sum: u64,
}

impl TrafficSnapshot {
    /// Mean hop distance of received user messages.
    pub fn average_hops(&self) -> f64 {
        if self.messages_rx == 0 {
            0.0
        } else {
            self.hop_count_sum as f64 / self.messages_rx as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_and_snapshot() {
        let stats = TrafficStats::new();
        stats.record_sent(11);
        stats.record_sent(5);
        stats.record_received(7);
        stats.record_hops(2);

        let snap = stats.snapshot();
        assert_eq!(snap.messages_tx, 2);
        assert_eq!(snap.bytes_tx, 16);
        assert_eq!(snap.messages_rx, 1);
        assert_eq!(snap.bytes_rx, 7);
        assert_eq!(snap.hop_count_sum, 2);
        assert_eq!(snap.average_hops(), 2.0);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let stats = TrafficStats::new();
        stats.record_sent(100);
        stats.record_received(50);
        stats.record_hops(9);

        stats.reset();
        assert_eq!(stats.snapshot(), TrafficSnapshot::default());
        assert_eq!(stats.snapshot().average_hops(), 0.0);
    }

    #[test]
    fn test_concurrent_updates_all_land() {
        let stats = Arc::new(TrafficStats::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let stats = stats.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    stats.record_sent(3);
                    stats.record_received(2);
                    stats.record_hops(1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = stats.snapshot();
        assert_eq!(snap.messages_tx, 4000);
        assert_eq!(snap.bytes_tx, 12000);
        assert_eq!(snap.messages_rx, 4000);
        assert_eq!(snap.bytes_rx, 8000);
        assert_eq!(snap.hop_count_sum, 4000);
    }
}
