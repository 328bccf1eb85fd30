//! Pipeline counters.
//!
//! Tracked via atomics so the push path never takes a lock; read through
//! [`ManagerStats::snapshot`]. Recording can never fail.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub buffered_pushes: u64,
    pub fallback_pushes: u64,
    pub consolidations: u64,
    pub merged_updates: u64,
    pub consolidation_failures: u64,
    pub lock_contentions: u64,
    pub empty_drains: u64,
    pub safety_net_failures: u64,
    pub merge_micros: u64,
}

/// Lock-free counters shared by a manager and its worker.
#[derive(Debug, Default)]
pub struct ManagerStats {
    buffered_pushes: AtomicU64,
    fallback_pushes: AtomicU64,
    consolidations: AtomicU64,
    merged_updates: AtomicU64,
    consolidation_failures: AtomicU64,
    lock_contentions: AtomicU64,
    empty_drains: AtomicU64,
    safety_net_failures: AtomicU64,
    merge_micros: AtomicU64,
}

impl ManagerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_buffered_push(&self) {
        self.buffered_pushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_push(&self) {
        self.fallback_pushes.fetch_add(1, Ordering::Relaxed);
    }

    /// A snapshot was written from `updates` fragments in `elapsed`.
    pub fn record_consolidation(&self, updates: usize, elapsed: Duration) {
        self.consolidations.fetch_add(1, Ordering::Relaxed);
        self.merged_updates
            .fetch_add(updates as u64, Ordering::Relaxed);
        self.merge_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_consolidation_failure(&self) {
        self.consolidation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_contention(&self) {
        self.lock_contentions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty_drain(&self) {
        self.empty_drains.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_safety_net_failure(&self) {
        self.safety_net_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            buffered_pushes: self.buffered_pushes.load(Ordering::Relaxed),
            fallback_pushes: self.fallback_pushes.load(Ordering::Relaxed),
            consolidations: self.consolidations.load(Ordering::Relaxed),
            merged_updates: self.merged_updates.load(Ordering::Relaxed),
            consolidation_failures: self.consolidation_failures.load(Ordering::Relaxed),
            lock_contentions: self.lock_contentions.load(Ordering::Relaxed),
            empty_drains: self.empty_drains.load(Ordering::Relaxed),
            safety_net_failures: self.safety_net_failures.load(Ordering::Relaxed),
            merge_micros: self.merge_micros.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ManagerStats::new();
        stats.record_buffered_push();
        stats.record_buffered_push();
        stats.record_fallback_push();
        stats.record_consolidation(3, Duration::from_micros(250));
        stats.record_lock_contention();

        let snap = stats.snapshot();
        assert_eq!(snap.buffered_pushes, 2);
        assert_eq!(snap.fallback_pushes, 1);
        assert_eq!(snap.consolidations, 1);
        assert_eq!(snap.merged_updates, 3);
        assert_eq!(snap.merge_micros, 250);
        assert_eq!(snap.lock_contentions, 1);
        assert_eq!(snap.consolidation_failures, 0);
    }
}
