//! Cache Metrics Collection
//!
//! Counters shared by the service and its handlers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Service operations
    gets: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    flushes: AtomicU64,
    handler_failures: AtomicU64,

    // Replication
    node_failures: AtomicU64,
    repair_writes: AtomicU64,
    replica_trims: AtomicU64,

    // Read latency (microseconds, exponential moving average)
    read_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// A handler failed during a fan-out operation
    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A node did not answer within `attempts_max` attempts
    pub fn record_node_failure(&self) {
        self.node_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A missing replica was written during a read
    pub fn record_repair_write(&self) {
        self.repair_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// An excess replica was deleted during a read
    pub fn record_replica_trim(&self) {
        self.replica_trims.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn repair_writes(&self) -> u64 {
        self.repair_writes.load(Ordering::Relaxed)
    }

    pub fn replica_trims(&self) -> u64 {
        self.replica_trims.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn record_read_latency(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = self.read_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .read_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn read_latency(&self) -> Duration {
        Duration::from_micros(self.read_latency_us.load(Ordering::Relaxed))
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            gets: self.gets.load(Ordering::Relaxed),
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            node_failures: self.node_failures.load(Ordering::Relaxed),
            repair_writes: self.repair_writes(),
            replica_trims: self.replica_trims(),
            read_latency_us: self.read_latency().as_micros() as u64,
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.gets,
            &self.hits,
            &self.misses,
            &self.sets,
            &self.deletes,
            &self.flushes,
            &self.handler_failures,
            &self.node_failures,
            &self.repair_writes,
            &self.replica_trims,
            &self.read_latency_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub gets: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub sets: u64,
    pub deletes: u64,
    pub flushes: u64,
    pub handler_failures: u64,
    pub node_failures: u64,
    pub repair_writes: u64,
    pub replica_trims: u64,
    pub read_latency_us: u64,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();

        assert_eq!(metrics.hits(), 2);
        assert_eq!(metrics.misses(), 1);
        assert!((metrics.hit_ratio() - 0.666).abs() < 0.01);
        assert_eq!(metrics.snapshot().gets, 3);
    }

    #[test]
    fn test_latency_ema() {
        let metrics = CacheMetrics::new();

        metrics.record_read_latency(Duration::from_micros(100));
        assert_eq!(metrics.read_latency(), Duration::from_micros(100));

        metrics.record_read_latency(Duration::from_micros(200));
        let latency = metrics.read_latency().as_micros();
        assert!(latency > 100 && latency < 200);
    }

    #[test]
    fn test_replication_counters() {
        let metrics = CacheMetrics::new();
        metrics.record_repair_write();
        metrics.record_repair_write();
        metrics.record_replica_trim();
        metrics.record_node_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.repair_writes, 2);
        assert_eq!(snapshot.replica_trims, 1);
        assert_eq!(snapshot.node_failures, 1);
    }

    #[test]
    fn test_reset() {
        let metrics = CacheMetrics::new();
        metrics.record_hit();
        metrics.record_set();
        metrics.record_handler_failure();

        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.hits, 0);
        assert_eq!(snapshot.sets, 0);
        assert_eq!(snapshot.handler_failures, 0);
    }

    #[test]
    fn test_latency_tracker() {
        let tracker = LatencyTracker::start();
        std::thread::sleep(Duration::from_millis(10));
        assert!(tracker.elapsed() >= Duration::from_millis(10));
    }
}
