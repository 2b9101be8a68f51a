// Matrixon Matrix Server - Sliding Sync Metrics Module
// Author: arkSong (arksong2018@gmail.com)
// Date: 2024-12-19
// Version: 1.0
// Purpose: Lock-free counters for the sliding sync request path

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Performance metrics
#[derive(Debug, Default)]
pub struct SlidingSyncMetrics {
    /// Total requests handled
    pub total_requests: AtomicU64,

    /// Requests that returned an empty result after waiting out the timeout
    pub timed_out_requests: AtomicU64,

    /// Requests rejected because of invalid input or a concurrent request
    pub rejected_requests: AtomicU64,

    /// Requests that took the full SYNC path for at least one list
    pub full_resyncs: AtomicU64,

    /// Operations emitted across all lists
    pub ops_emitted: AtomicU64,

    /// Item payloads fetched from the item source
    pub items_fetched: AtomicU64,

    /// Wake-ups delivered to waiting requests
    pub wakeups: AtomicU64,

    /// Connections dropped by idle cleanup, LRU pressure or stale tokens
    pub evicted_connections: AtomicU64,

    /// Last response time (microseconds)
    pub last_response_time_us: AtomicU64,
}

/// Point-in-time copy of [`SlidingSyncMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub timed_out_requests: u64,
    pub rejected_requests: u64,
    pub full_resyncs: u64,
    pub ops_emitted: u64,
    pub items_fetched: u64,
    pub wakeups: u64,
    pub evicted_connections: u64,
    pub last_response_time_us: u64,
}

impl SlidingSyncMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            timed_out_requests: self.timed_out_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            full_resyncs: self.full_resyncs.load(Ordering::Relaxed),
            ops_emitted: self.ops_emitted.load(Ordering::Relaxed),
            items_fetched: self.items_fetched.load(Ordering::Relaxed),
            wakeups: self.wakeups.load(Ordering::Relaxed),
            evicted_connections: self.evicted_connections.load(Ordering::Relaxed),
            last_response_time_us: self.last_response_time_us.load(Ordering::Relaxed),
        }
    }
}
