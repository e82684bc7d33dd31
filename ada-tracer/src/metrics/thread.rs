//! Per-thread counters living in the registry segment
//!
//! Each counter has exactly one writer (the owning producer, or the drain for
//! `max_queue_depth`), so plain relaxed increments suffice. Groups are padded
//! onto separate cache lines so the drain's reads do not bounce the
//! producer's hot line.

use crate::shm::SharedLayout;
use crossbeam_utils::CachePadded;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[repr(C)]
#[derive(Default)]
pub struct EventCounters {
    events_written: AtomicU64,
    events_dropped: AtomicU64,
    events_filtered: AtomicU64,
    bytes_written: AtomicU64,
}

#[repr(C)]
#[derive(Default)]
pub struct PressureCounters {
    pool_exhaustion_count: AtomicU64,
    ring_full_count: AtomicU64,
    allocation_failures: AtomicU64,
    max_queue_depth: AtomicU64,
    mirror_failures: AtomicU64,
}

#[repr(C)]
#[derive(Default)]
pub struct SwapCounters {
    swap_count: AtomicU64,
    last_swap_timestamp_ns: AtomicU64,
    total_swap_duration_ns: AtomicU64,
    rings_in_rotation: AtomicU64,
}

/// Metrics block of one thread lane set
#[repr(C)]
pub struct ThreadMetrics {
    counters: CachePadded<EventCounters>,
    pressure: CachePadded<PressureCounters>,
    swaps: CachePadded<SwapCounters>,
}

// SAFETY: repr(C), atomics only, zero means "nothing recorded"
unsafe impl SharedLayout for ThreadMetrics {}

/// Start of an in-flight ring swap
#[derive(Debug, Clone, Copy)]
#[must_use = "a swap token records nothing until passed to end_swap"]
pub struct SwapToken {
    started_ns: u64,
}

/// Point-in-time copy of one thread's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThreadMetricsSnapshot {
    pub events_written: u64,
    pub events_dropped: u64,
    pub events_filtered: u64,
    pub bytes_written: u64,
    pub pool_exhaustion_count: u64,
    pub ring_full_count: u64,
    pub allocation_failures: u64,
    pub max_queue_depth: u64,
    /// `DualWrite` mirrors the shared lane did not admit; the event itself
    /// still went to the thread's lane
    pub mirror_failures: u64,
    pub swap_count: u64,
    pub last_swap_timestamp_ns: u64,
    pub total_swap_duration_ns: u64,
    pub rings_in_rotation: u64,
}

impl ThreadMetricsSnapshot {
    /// Dropped share of all attempted events, in percent
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn drop_rate_percent(&self) -> f64 {
        let attempted = self.events_written + self.events_dropped;
        if attempted == 0 {
            0.0
        } else {
            self.events_dropped as f64 * 100.0 / attempted as f64
        }
    }

    #[must_use]
    pub fn avg_swap_duration_ns(&self) -> u64 {
        self.total_swap_duration_ns.checked_div(self.swap_count).unwrap_or(0)
    }
}

impl ThreadMetrics {
    /// Zero every counter. Registration only.
    pub(crate) fn reset(&self, rings_in_rotation: u64) {
        let all = [
            &self.counters.events_written,
            &self.counters.events_dropped,
            &self.counters.events_filtered,
            &self.counters.bytes_written,
            &self.pressure.pool_exhaustion_count,
            &self.pressure.ring_full_count,
            &self.pressure.allocation_failures,
            &self.pressure.max_queue_depth,
            &self.pressure.mirror_failures,
            &self.swaps.swap_count,
            &self.swaps.last_swap_timestamp_ns,
            &self.swaps.total_swap_duration_ns,
        ];
        for counter in all {
            counter.store(0, Ordering::Relaxed);
        }
        self.swaps.rings_in_rotation.store(rings_in_rotation, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_written(&self, bytes: u64) {
        self.counters.events_written.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped(&self) {
        self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_filtered(&self) {
        self.counters.events_filtered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ring_full(&self) {
        self.pressure.ring_full_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_pool_exhaustion(&self) {
        self.pressure.pool_exhaustion_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_allocation_failure(&self) {
        self.pressure.allocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_mirror_failure(&self) {
        self.pressure.mirror_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Drain only
    pub fn observe_queue_depth(&self, depth: u64) {
        self.pressure.max_queue_depth.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn begin_swap(&self, now_ns: u64) -> SwapToken {
        SwapToken { started_ns: now_ns }
    }

    pub fn end_swap(&self, token: SwapToken, now_ns: u64) {
        self.swaps.swap_count.fetch_add(1, Ordering::Relaxed);
        self.swaps.last_swap_timestamp_ns.store(now_ns, Ordering::Relaxed);
        self.swaps.total_swap_duration_ns.fetch_add(now_ns.saturating_sub(token.started_ns), Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> ThreadMetricsSnapshot {
        ThreadMetricsSnapshot {
            events_written: self.counters.events_written.load(Ordering::Relaxed),
            events_dropped: self.counters.events_dropped.load(Ordering::Relaxed),
            events_filtered: self.counters.events_filtered.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
            pool_exhaustion_count: self.pressure.pool_exhaustion_count.load(Ordering::Relaxed),
            ring_full_count: self.pressure.ring_full_count.load(Ordering::Relaxed),
            allocation_failures: self.pressure.allocation_failures.load(Ordering::Relaxed),
            max_queue_depth: self.pressure.max_queue_depth.load(Ordering::Relaxed),
            mirror_failures: self.pressure.mirror_failures.load(Ordering::Relaxed),
            swap_count: self.swaps.swap_count.load(Ordering::Relaxed),
            last_swap_timestamp_ns: self.swaps.last_swap_timestamp_ns.load(Ordering::Relaxed),
            total_swap_duration_ns: self.swaps.total_swap_duration_ns.load(Ordering::Relaxed),
            rings_in_rotation: self.swaps.rings_in_rotation.load(Ordering::Relaxed),
        }
    }
}
