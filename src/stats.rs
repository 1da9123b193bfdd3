//! Statistics tracking for the resolver.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Atomic counters shared between the event loop and the stats reporter.
pub struct Stats {
    pub requests: AtomicU64,
    pub resolved: AtomicU64,
    pub cached: AtomicU64,
    pub ptr: AtomicU64,
    pub failed: AtomicU64,
    /// Cumulative response time in microseconds for averaging.
    total_response_time_us: AtomicU64,
    cache_entries: AtomicUsize,
    in_flight: AtomicUsize,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
            cached: AtomicU64::new(0),
            ptr: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
            cache_entries: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn record_resolved(&self, response_time_ms: f64) {
        self.record(&self.resolved, response_time_ms);
    }

    pub fn record_cached(&self, response_time_ms: f64) {
        self.record(&self.cached, response_time_ms);
    }

    pub fn record_ptr(&self, response_time_ms: f64) {
        self.record(&self.ptr, response_time_ms);
    }

    pub fn record_failed(&self, response_time_ms: f64) {
        self.record(&self.failed, response_time_ms);
    }

    fn record(&self, counter: &AtomicU64, response_time_ms: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add((response_time_ms * 1000.0) as u64, Ordering::Relaxed);
    }

    /// Gauges refreshed by the engine on every sweep.
    pub fn set_gauges(&self, cache_entries: usize, in_flight: usize) {
        self.cache_entries.store(cache_entries, Ordering::Relaxed);
        self.in_flight.store(in_flight, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let resolved = self.resolved.swap(0, Ordering::Relaxed);
        let cached = self.cached.swap(0, Ordering::Relaxed);
        let ptr = self.ptr.swap(0, Ordering::Relaxed);
        let failed = self.failed.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        let avg_response_ms = if requests > 0 {
            (total_us as f64 / requests as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            requests,
            resolved,
            cached,
            ptr,
            failed,
            avg_response_ms,
            cache_entries: self.cache_entries.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StatsSnapshot {
    pub requests: u64,
    pub resolved: u64,
    pub cached: u64,
    pub ptr: u64,
    pub failed: u64,
    pub avg_response_ms: f64,
    pub cache_entries: usize,
    pub in_flight: usize,
}
