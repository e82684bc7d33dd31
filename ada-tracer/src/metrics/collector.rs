//! Single-consumer metrics collector
//!
//! Owned by the drain. Each collection snapshots every claimed slot, records
//! the lanes' queue depths into the slot's `max_queue_depth`, feeds the rate
//! calculators and returns a serializable [`GlobalMetricsSnapshot`].

use super::rate::RateCalculator;
use super::thread::ThreadMetricsSnapshot;
use crate::backpressure::{BackpressureSnapshot, PressureState};
use crate::domain::{SlotIndex, ThreadId};
use crate::registry::{LaneKind, ThreadRegistry};
use serde::Serialize;

/// One slot's view in a [`GlobalMetricsSnapshot`]
#[derive(Debug, Clone, Serialize)]
pub struct ThreadMetricsEntry {
    pub slot: SlotIndex,
    pub thread_id: ThreadId,
    pub active: bool,
    pub metrics: ThreadMetricsSnapshot,
    pub index_state: PressureState,
    pub detail_state: PressureState,
    pub index_pressure: BackpressureSnapshot,
    pub detail_pressure: BackpressureSnapshot,
    pub events_per_second: f64,
    pub bytes_per_second: f64,
    pub drop_rate_percent: f64,
    pub avg_swap_duration_ns: u64,
}

/// System-wide totals plus per-thread entries
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalMetricsSnapshot {
    pub timestamp_ns: u64,
    pub registered_threads: u32,
    pub active_threads: u32,
    pub registration_failures: u64,
    pub total_events_written: u64,
    pub total_events_dropped: u64,
    pub total_events_filtered: u64,
    pub total_bytes_written: u64,
    pub total_swaps: u64,
    pub events_per_second: f64,
    pub bytes_per_second: f64,
    pub swaps_per_second: f64,
    pub drop_rate_percent: f64,
    pub threads: Vec<ThreadMetricsEntry>,
}

#[derive(Debug)]
pub struct MetricsCollector {
    interval_ns: u64,
    window_ns: u64,
    last_collect_ns: Option<u64>,
    system_rate: RateCalculator,
    swap_rate: RateCalculator,
    thread_rates: Vec<RateCalculator>,
    latest: Option<GlobalMetricsSnapshot>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new(interval_ns: u64, window_ns: u64) -> Self {
        Self {
            interval_ns,
            window_ns,
            last_collect_ns: None,
            system_rate: RateCalculator::new(window_ns),
            swap_rate: RateCalculator::new(window_ns),
            thread_rates: Vec::new(),
            latest: None,
        }
    }

    /// Collect if the interval has elapsed since the previous collection
    pub fn collect(&mut self, registry: &ThreadRegistry, now_ns: u64) -> Option<&GlobalMetricsSnapshot> {
        if let Some(last) = self.last_collect_ns {
            if now_ns.saturating_sub(last) < self.interval_ns {
                return None;
            }
        }
        Some(self.collect_now(registry, now_ns))
    }

    /// Collect unconditionally
    #[allow(clippy::cast_precision_loss)]
    pub fn collect_now(&mut self, registry: &ThreadRegistry, now_ns: u64) -> &GlobalMetricsSnapshot {
        self.last_collect_ns = Some(now_ns);
        let mut snap = GlobalMetricsSnapshot {
            timestamp_ns: now_ns,
            registered_threads: registry.registered_count(),
            registration_failures: registry.registration_failures(),
            ..GlobalMetricsSnapshot::default()
        };

        for slot in registry.slots() {
            let index_lane = slot.index_lane();
            let detail_lane = slot.detail_lane();
            let metrics = slot.metrics();
            metrics.observe_queue_depth(u64::from(index_lane.submitted_depth() + detail_lane.submitted_depth()));
            let m = metrics.snapshot();

            let idx = slot.index().as_usize();
            while self.thread_rates.len() <= idx {
                self.thread_rates.push(RateCalculator::new(self.window_ns));
            }
            let rate = &mut self.thread_rates[idx];
            rate.add_sample(now_ns, m.events_written, m.bytes_written);
            let (eps, bps) = rate.rates();

            snap.total_events_written += m.events_written;
            snap.total_events_dropped += m.events_dropped;
            snap.total_events_filtered += m.events_filtered;
            snap.total_bytes_written += m.bytes_written;
            snap.total_swaps += m.swap_count;
            if slot.is_active() {
                snap.active_threads += 1;
            }

            let index_bp = slot.backpressure(LaneKind::Index);
            let detail_bp = slot.backpressure(LaneKind::Detail);
            snap.threads.push(ThreadMetricsEntry {
                slot: slot.index(),
                thread_id: slot.thread_id(),
                active: slot.is_active(),
                metrics: m,
                index_state: index_bp.state(),
                detail_state: detail_bp.state(),
                index_pressure: index_bp.snapshot(),
                detail_pressure: detail_bp.snapshot(),
                events_per_second: eps,
                bytes_per_second: bps,
                drop_rate_percent: m.drop_rate_percent(),
                avg_swap_duration_ns: m.avg_swap_duration_ns(),
            });
        }

        self.system_rate.add_sample(now_ns, snap.total_events_written, snap.total_bytes_written);
        (snap.events_per_second, snap.bytes_per_second) = self.system_rate.rates();
        self.swap_rate.add_sample(now_ns, snap.total_swaps, 0);
        snap.swaps_per_second = self.swap_rate.rates().0;

        let attempted = snap.total_events_written + snap.total_events_dropped;
        if attempted > 0 {
            snap.drop_rate_percent = snap.total_events_dropped as f64 * 100.0 / attempted as f64;
        }

        self.latest.insert(snap)
    }

    /// Most recent collection
    #[must_use]
    pub fn latest(&self) -> Option<&GlobalMetricsSnapshot> {
        self.latest.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackpressureConfig, RegistryConfig};
    use crate::domain::SessionId;
    use crate::shm::ShmSegment;

    const MS: u64 = 1_000_000;

    fn registry() -> ThreadRegistry {
        let config = RegistryConfig { max_threads: 4, ..RegistryConfig::default() };
        let seg = ShmSegment::anonymous("/collector", ThreadRegistry::required_size(&config)).unwrap();
        ThreadRegistry::create(seg, &config, &BackpressureConfig::default(), SessionId(3)).unwrap()
    }

    #[test]
    fn test_collects_totals_and_rates() {
        let reg = registry();
        let a = reg.register(ThreadId(1)).unwrap();
        let b = reg.register(ThreadId(2)).unwrap();
        let mut collector = MetricsCollector::new(100 * MS, 1_000 * MS);

        assert!(collector.collect(&reg, 0).is_some());
        for _ in 0..100 {
            a.metrics().record_written(32);
        }
        for _ in 0..50 {
            b.metrics().record_written(32);
        }
        b.metrics().record_dropped();

        assert!(collector.collect(&reg, 50 * MS).is_none());
        let snap = collector.collect(&reg, 500 * MS).unwrap();
        assert_eq!(snap.registered_threads, 2);
        assert_eq!(snap.active_threads, 2);
        assert_eq!(snap.total_events_written, 150);
        assert_eq!(snap.total_events_dropped, 1);
        assert_eq!(snap.total_bytes_written, 4_800);
        assert!((snap.events_per_second - 300.0).abs() < 1e-6);
        assert!((snap.threads[0].events_per_second - 200.0).abs() < 1e-6);
        assert_eq!(snap.threads.len(), 2);
    }

    #[test]
    fn test_inactive_threads_still_reported() {
        let reg = registry();
        let slot = reg.register(ThreadId(9)).unwrap().index();
        reg.unregister(slot);
        let mut collector = MetricsCollector::new(MS, MS);
        let snap = collector.collect_now(&reg, 10);
        assert_eq!(snap.active_threads, 0);
        assert_eq!(snap.threads.len(), 1);
        assert!(!snap.threads[0].active);
        assert!(collector.latest().is_some());
    }
}
