//! Lock-free counters describing cache behaviour.

use std::sync::atomic::{AtomicU64, Ordering};

/// Hit/miss and pipeline counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    durable_hits: AtomicU64,
    updates_accepted: AtomicU64,
    updates_rejected: AtomicU64,
    batches_dispatched: AtomicU64,
    lookup_failures: AtomicU64,
    retries_scheduled: AtomicU64,
    retries_abandoned: AtomicU64,
    records_flushed: AtomicU64,
    flush_failures: AtomicU64,
    records_evicted: AtomicU64,
}

/// Snapshot of [`CacheStats`] at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub durable_hits: u64,
    pub updates_accepted: u64,
    pub updates_rejected: u64,
    pub batches_dispatched: u64,
    pub lookup_failures: u64,
    pub retries_scheduled: u64,
    pub retries_abandoned: u64,
    pub records_flushed: u64,
    pub flush_failures: u64,
    pub records_evicted: u64,
}

impl CacheStatsSnapshot {
    /// Share of reads served from memory (0.0–1.0). Returns 0.0 before any read.
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

macro_rules! counters {
    ($($record:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $record(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    counters! {
        record_hit => hits,
        record_stale_hit => stale_hits,
        record_miss => misses,
        record_durable_hit => durable_hits,
        record_accepted => updates_accepted,
        record_rejected => updates_rejected,
        record_batch_dispatched => batches_dispatched,
        record_retry_scheduled => retries_scheduled,
        record_retry_abandoned => retries_abandoned,
        record_flush_failure => flush_failures,
    }

    pub fn record_lookup_failures(&self, count: u64) {
        self.lookup_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_flushed(&self, count: u64) {
        self.records_flushed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, count: u64) {
        self.records_evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            durable_hits: self.durable_hits.load(Ordering::Relaxed),
            updates_accepted: self.updates_accepted.load(Ordering::Relaxed),
            updates_rejected: self.updates_rejected.load(Ordering::Relaxed),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            lookup_failures: self.lookup_failures.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            retries_abandoned: self.retries_abandoned.load(Ordering::Relaxed),
            records_flushed: self.records_flushed.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            records_evicted: self.records_evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats::new();
        assert!(stats.snapshot().hit_rate().abs() < f64::EPSILON);

        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits, 3);
        assert!((snapshot.hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bulk_counters() {
        let stats = CacheStats::new();
        stats.record_lookup_failures(4);
        stats.record_flushed(10);
        stats.record_evicted(2);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.lookup_failures, 4);
        assert_eq!(snapshot.records_flushed, 10);
        assert_eq!(snapshot.records_evicted, 2);
    }
}
