//! Per-store resource limits.
//!
//! Each module store gets a memory ceiling enforced by a tracking
//! [`ResourceLimiter`] and a fuel budget refilled before every guest call.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;
use wasmtime::ResourceLimiter;

/// Resource limits for one module store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum linear memory in bytes, summed over every unit of a module.
    pub max_memory_bytes: usize,
    /// CPU fuel budget per guest call (prevents infinite loops).
    pub fuel_per_call: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 64 * 1024 * 1024, // 64MB
            fuel_per_call: 1_000_000_000,       // ~1 billion instructions
        }
    }
}

/// A resource limiter that tracks actual memory usage.
pub struct TrackingLimiter {
    max_memory: usize,
    /// Sum of all memories' sizes, updated from grow callbacks.
    current_memory: AtomicUsize,
    max_tables: usize,
    max_table_elements: usize,
    max_instances: usize,
    max_memories: usize,
}

impl TrackingLimiter {
    pub fn new(max_memory: usize) -> Self {
        Self {
            max_memory,
            current_memory: AtomicUsize::new(0),
            max_tables: 100,
            max_table_elements: 20_000,
            max_instances: 100,
            max_memories: 100,
        }
    }

    /// Current memory usage in bytes.
    pub fn current_memory_bytes(&self) -> usize {
        self.current_memory.load(Ordering::Relaxed)
    }
}

impl ResourceLimiter for TrackingLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        let total = self.current_memory_bytes() - current.min(self.current_memory_bytes()) + desired;
        if total <= self.max_memory {
            self.current_memory.store(total, Ordering::Relaxed);
            Ok(true)
        } else {
            debug!(
                current = current,
                desired = desired,
                max = self.max_memory,
                "Memory growth denied - would exceed limit"
            );
            Ok(false)
        }
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        Ok(desired <= self.max_table_elements)
    }

    fn instances(&self) -> usize {
        self.max_instances
    }

    fn tables(&self) -> usize {
        self.max_tables
    }

    fn memories(&self) -> usize {
        self.max_memories
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_within_limit_is_tracked() {
        let mut limiter = TrackingLimiter::new(1024 * 1024);
        assert!(limiter.memory_growing(0, 65536, None).unwrap());
        assert_eq!(limiter.current_memory_bytes(), 65536);
        assert!(limiter.memory_growing(65536, 131072, None).unwrap());
        assert_eq!(limiter.current_memory_bytes(), 131072);
    }

    #[test]
    fn growth_beyond_limit_is_denied() {
        let mut limiter = TrackingLimiter::new(65536);
        assert!(!limiter.memory_growing(0, 131072, None).unwrap());
        assert_eq!(limiter.current_memory_bytes(), 0);
    }

    #[test]
    fn second_memory_counts_toward_total() {
        let mut limiter = TrackingLimiter::new(100_000);
        assert!(limiter.memory_growing(0, 65536, None).unwrap());
        assert!(!limiter.memory_growing(0, 65536, None).unwrap());
    }
}
