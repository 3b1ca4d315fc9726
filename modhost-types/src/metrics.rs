//! Per-module counters mutated on every dispatch.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free metrics record shared between dispatch workers.
#[derive(Debug, Default)]
pub struct ModuleMetrics {
    messages_handled: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    memory_bytes: AtomicU64,
}

impl ModuleMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one inbound message of `bytes` length.
    pub fn record_received(&self, bytes: usize) {
        self.messages_handled.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Stores the last sampled memory footprint.
    pub fn sample_memory(&self, bytes: u64) {
        self.memory_bytes.store(bytes, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_handled: self.messages_handled.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            memory_bytes: self.memory_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ModuleMetrics`], for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub messages_handled: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub memory_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counters_accumulate() {
        let metrics = ModuleMetrics::new();
        metrics.record_received(10);
        metrics.record_received(5);
        metrics.record_sent(7);
        metrics.sample_memory(65536);

        let snap = metrics.snapshot();
        assert_eq!(snap.messages_handled, 2);
        assert_eq!(snap.bytes_received, 15);
        assert_eq!(snap.bytes_sent, 7);
        assert_eq!(snap.memory_bytes, 65536);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let metrics = Arc::new(ModuleMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        m.record_received(2);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.messages_handled, 8000);
        assert_eq!(snap.bytes_received, 16000);
    }
}
