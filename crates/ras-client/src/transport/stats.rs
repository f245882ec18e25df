use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ras_common::helpers::now_millis;

/// Per-transport counters. Updated lock-free from send/receive paths.
#[derive(Debug)]
pub struct TransportStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    connected_at_ms: u64,
    last_activity_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub connected_at_ms: u64,
    pub last_activity_ms: u64,
}

impl StatsSnapshot {
    pub fn idle_for(&self) -> Duration {
        Duration::from_millis(now_millis().saturating_sub(self.last_activity_ms))
    }
}

impl Default for TransportStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportStats {
    pub fn new() -> Self {
        let now = now_millis();
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            connected_at_ms: now,
            last_activity_ms: AtomicU64::new(now),
        }
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        self.last_activity_ms.fetch_max(now_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            connected_at_ms: self.connected_at_ms,
            last_activity_ms: self.last_activity_ms.load(Ordering::Relaxed),
        }
    }
}
