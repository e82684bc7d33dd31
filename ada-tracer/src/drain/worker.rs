//! Drain pass logic
//!
//! One `run_pass` visits the shared lane and then every claimed slot in order.
//! Per slot it sheds (drop-oldest lanes only), takes submitted index rings,
//! takes submitted detail rings, pairs the two streams, writes, returns the
//! rings and lets the backpressure controllers check for recovery.
//!
//! ## Pairing
//!
//! ```text
//! pending index:   [I0 d=0] [I1 -] [I2 d=1] [I3 d=3]
//! pending detail:  [D0]            [D1] [D2]  [D3]
//!                    │                │    │     │
//!                  pair            pair  orphan pair
//! ```
//!
//! Index events are written in arrival order. One waiting for a detail that
//! has not been drained yet holds the queue behind it, bounded by
//! `max_pending_events`.

use super::manifest::SessionManifest;
use crate::atf::{TraceSummary, TraceWriter};
use crate::backpressure::{DropPolicy, PressureState};
use crate::config::DrainConfig;
use crate::domain::{SessionError, SessionMode};
use crate::lane::Lane;
use crate::metrics::{GlobalMetricsSnapshot, MetricsCollector};
use crate::registry::{LaneKind, ThreadSlot};
use crate::session::Session;
use crate::shm::SessionState;
use ada_tracer_common::{DetailRecord, GlobalRecord, IndexEvent, Pod};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

const GLOBAL_BATCH: usize = 4096;

/// Cumulative drain counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainStats {
    pub passes: u64,
    pub rings_drained: u64,
    pub index_events_written: u64,
    pub detail_events_written: u64,
    pub global_events_written: u64,
    pub mirrored_discarded: u64,
    /// Details whose index event never arrived
    pub orphan_details: u64,
    /// Linked index events whose detail never arrived
    pub missing_details: u64,
    /// Details outside the capture window
    pub filtered_details: u64,
    /// Index events flushed early because too many were waiting
    pub pending_overflows: u64,
    pub rings_shed: u64,
    pub shed_events: u64,
    pub stalls_detected: u64,
    pub mode_changes: u64,
}

/// Everything known once the drain has finalized
#[derive(Debug, Clone, Serialize)]
pub struct DrainReport {
    pub summary: TraceSummary,
    pub stats: DrainStats,
    pub metrics: GlobalMetricsSnapshot,
    pub manifest_path: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct SlotPending {
    index: VecDeque<IndexEvent>,
    details: VecDeque<DetailRecord>,
}

pub struct DrainWorker {
    session: Arc<Session>,
    config: DrainConfig,
    policy: DropPolicy,
    writer: TraceWriter,
    collector: MetricsCollector,
    pending: Vec<SlotPending>,
    healthy_passes: u32,
    last_pass_ns: Option<u64>,
    stats: DrainStats,
    report: Option<DrainReport>,
}

impl std::fmt::Debug for DrainWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainWorker")
            .field("session", &self.session.name())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// `a` precedes `b` in a producer sequence that wraps at `u32::MAX`
#[allow(clippy::cast_possible_wrap)]
fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Move everything readable from `ring_idx` of `lane` into `out`
fn drain_ring<T: Pod>(lane: &Lane<'_>, ring_idx: u32, out: &mut VecDeque<T>) {
    let Some(ring) = lane.ring(ring_idx) else {
        return;
    };
    let mut batch: Vec<T> = Vec::new();
    #[allow(clippy::cast_possible_truncation)]
    let available = ring.available_read() as usize;
    ring.drain_records(&mut batch, available);
    out.extend(batch);
}

impl DrainWorker {
    /// Open the trace files in the session's output directory
    pub fn new(session: Arc<Session>) -> Result<Self, SessionError> {
        let config = session.config().drain.clone();
        let policy = session.config().backpressure.policy;
        let writer = TraceWriter::create(&session.config().output_dir, 0)?;
        let collector = MetricsCollector::new(
            config.metrics_interval_ms.saturating_mul(1_000_000),
            config.rate_window_ms.saturating_mul(1_000_000),
        );
        Ok(Self {
            session,
            config,
            policy,
            writer,
            collector,
            pending: Vec::new(),
            healthy_passes: 0,
            last_pass_ns: None,
            stats: DrainStats::default(),
            report: None,
        })
    }

    #[must_use]
    pub fn stats(&self) -> &DrainStats {
        &self.stats
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// One steady-state pass
    pub fn run_pass(&mut self, now_ns: u64) -> Result<(), SessionError> {
        if self.report.is_some() {
            return Err(SessionError::AlreadyFinalized(self.session.name().to_string()));
        }
        let session = Arc::clone(&self.session);
        let control = session.control();

        self.check_stall(now_ns);
        control.beat(now_ns);
        control.set_drain_ready(true);

        self.drain_global()?;
        for slot in session.registry().slots() {
            self.drain_slot(&slot, now_ns, false)?;
        }
        self.writer.flush()?;

        self.advance_mode();
        self.stats.passes += 1;
        self.last_pass_ns = Some(now_ns);

        if let Some(snap) = self.collector.collect(session.registry(), now_ns) {
            debug!(
                "drain pass {}: {} threads, {:.0} events/s, {:.2}% dropped",
                self.stats.passes, snap.active_threads, snap.events_per_second, snap.drop_rate_percent
            );
        }
        Ok(())
    }

    /// A gap longer than the stall timeout means producers may already have
    /// fallen back to the shared lane; earn promotion again from `DualWrite`
    fn check_stall(&mut self, now_ns: u64) {
        let Some(last) = self.last_pass_ns else {
            return;
        };
        let control = self.session.control();
        if now_ns.saturating_sub(last) <= control.stall_timeout_ns() {
            return;
        }
        self.stats.stalls_detected += 1;
        self.healthy_passes = 0;
        warn!("drain stalled for {} ms", now_ns.saturating_sub(last) / 1_000_000);
        if control.mode() == SessionMode::PerThreadOnly {
            control.set_mode(SessionMode::DualWrite);
            self.stats.mode_changes += 1;
        }
    }

    fn advance_mode(&mut self) {
        let control = self.session.control();
        self.healthy_passes = self.healthy_passes.saturating_add(1);
        let next = match control.mode() {
            SessionMode::GlobalOnly => Some(SessionMode::DualWrite),
            SessionMode::DualWrite if self.healthy_passes > self.config.promote_after_passes => {
                Some(SessionMode::PerThreadOnly)
            }
            _ => None,
        };
        if let Some(mode) = next {
            info!("session mode {} -> {mode}", control.mode());
            control.set_mode(mode);
            self.stats.mode_changes += 1;
        }
    }

    fn drain_global(&mut self) -> Result<(), SessionError> {
        let mut records: Vec<GlobalRecord> = Vec::new();
        while self.session.global_lane().drain_into(&mut records, GLOBAL_BATCH) > 0 {
            for record in records.drain(..) {
                if record.is_mirrored() {
                    self.stats.mirrored_discarded += 1;
                } else {
                    self.writer.write_unlinked(&record.event)?;
                    self.stats.global_events_written += 1;
                    self.stats.index_events_written += 1;
                }
            }
        }
        Ok(())
    }

    /// Drop-oldest: discard every submitted ring but the newest while the
    /// lane is dropping
    fn shed_oldest(&mut self, slot: &ThreadSlot<'_>, kind: LaneKind) {
        let lane = slot.lane(kind);
        let pressure = slot.backpressure(kind);
        if pressure.state() != PressureState::Dropping {
            return;
        }
        while lane.submitted_depth() > 1 {
            let Some(idx) = lane.take_ring() else {
                break;
            };
            if let Some(ring) = lane.ring(idx) {
                let events = ring.discard_all();
                pressure.on_shed(events, events * ring.element_size() as u64);
                self.stats.shed_events += events;
            }
            lane.return_ring(idx);
            self.stats.rings_shed += 1;
        }
    }

    fn drain_slot(&mut self, slot: &ThreadSlot<'_>, now_ns: u64, finalizing: bool) -> Result<(), SessionError> {
        let idx = slot.index().as_usize();
        if self.pending.len() <= idx {
            self.pending.resize_with(idx + 1, SlotPending::default);
        }
        if self.policy == DropPolicy::DropOldest {
            self.shed_oldest(slot, LaneKind::Index);
            self.shed_oldest(slot, LaneKind::Detail);
        }

        let index_lane = slot.index_lane();
        let detail_lane = slot.detail_lane();
        let mut drained = 0;
        {
            let pending = &mut self.pending[idx];
            while let Some(ring) = index_lane.take_ring() {
                drain_ring(&index_lane, ring, &mut pending.index);
                index_lane.return_ring(ring);
                drained += 1;
            }
            while let Some(ring) = detail_lane.take_ring() {
                drain_ring(&detail_lane, ring, &mut pending.details);
                detail_lane.return_ring(ring);
                drained += 1;
            }
            if finalizing {
                drain_ring(&index_lane, index_lane.active_index(), &mut pending.index);
            }
            // The consumer side of an active ring is ours too; read it when a
            // link would otherwise wait for the next swap
            if finalizing || pending.index.iter().any(IndexEvent::has_detail) {
                drain_ring(&detail_lane, detail_lane.active_index(), &mut pending.details);
            }
        }
        self.stats.rings_drained += drained;

        self.resolve(slot, idx, finalizing)?;

        slot.backpressure(LaneKind::Index).sample(index_lane.free_depth(), now_ns);
        slot.backpressure(LaneKind::Detail).sample(detail_lane.free_depth(), now_ns);
        Ok(())
    }

    fn resolve(&mut self, slot: &ThreadSlot<'_>, idx: usize, finalizing: bool) -> Result<(), SessionError> {
        let control = self.session.control();
        let max_pending = self.config.max_pending_events;
        let pending = &mut self.pending[idx];

        while let Some(&event) = pending.index.front() {
            if !event.has_detail() {
                self.writer.write_unlinked(&event)?;
                self.stats.index_events_written += 1;
                pending.index.pop_front();
                continue;
            }
            let wanted = event.detail_seq;
            while pending.details.front().is_some_and(|d| seq_before(d.detail_seq, wanted)) {
                pending.details.pop_front();
                self.stats.orphan_details += 1;
            }
            match pending.details.front() {
                Some(detail) if detail.detail_seq == wanted => {
                    if control.window_covers(detail.timestamp_ns) {
                        self.writer.write_linked(&event, detail)?;
                        self.stats.detail_events_written += 1;
                    } else {
                        self.writer.write_unlinked(&event)?;
                        self.stats.filtered_details += 1;
                        slot.metrics().record_filtered();
                    }
                    pending.details.pop_front();
                }
                Some(_) => {
                    self.writer.write_unlinked(&event)?;
                    self.stats.missing_details += 1;
                }
                None if finalizing => {
                    self.writer.write_unlinked(&event)?;
                    self.stats.missing_details += 1;
                }
                None if pending.index.len() > max_pending => {
                    self.writer.write_unlinked(&event)?;
                    self.stats.pending_overflows += 1;
                }
                None => break,
            }
            self.stats.index_events_written += 1;
            pending.index.pop_front();
        }

        if finalizing {
            self.stats.orphan_details += pending.details.len() as u64;
            pending.details.clear();
        }
        Ok(())
    }

    /// Final pass over everything including active rings, then close the
    /// files and write the manifest. Idempotent.
    pub fn finalize(&mut self, now_ns: u64) -> Result<DrainReport, SessionError> {
        if let Some(report) = &self.report {
            return Ok(report.clone());
        }
        let session = Arc::clone(&self.session);
        session.control().set_state(SessionState::Stopping);

        self.drain_global()?;
        for slot in session.registry().slots() {
            self.drain_slot(&slot, now_ns, true)?;
        }
        self.stats.passes += 1;

        let summary = self.writer.finalize()?;
        let metrics = self.collector.collect_now(session.registry(), now_ns).clone();
        session.control().set_drain_ready(false);
        session.control().set_state(SessionState::Finished);

        let manifest_path = if self.config.write_manifest {
            let manifest = SessionManifest::new(&session, summary, self.stats, metrics.clone());
            Some(manifest.write(self.writer.dir())?)
        } else {
            None
        };

        if self.stats.orphan_details + self.stats.missing_details > 0 {
            warn!(
                "{} orphan and {} missing detail events were written without links",
                self.stats.orphan_details, self.stats.missing_details
            );
        }
        info!(
            "drain finished: {} index / {} detail events, {} dropped by producers",
            summary.index_events, summary.detail_events, metrics.total_events_dropped
        );
        let report = DrainReport { summary, stats: self.stats, metrics, manifest_path };
        self.report = Some(report.clone());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atf::TraceReader;
    use crate::clock;
    use crate::config::{RegistryConfig, SessionConfig};
    use crate::domain::{EventKind, FunctionId, ThreadId};
    use crate::tracer::Tracer;
    use std::path::Path;

    const MS: u64 = 1_000_000;

    fn session(root: &Path, out: &Path) -> Arc<Session> {
        let mut config = SessionConfig {
            name: Some("drain".to_string()),
            shm_root: root.to_path_buf(),
            output_dir: out.to_path_buf(),
            registry: RegistryConfig {
                max_threads: 2,
                index_rings: 2,
                index_ring_capacity: 8,
                detail_rings: 2,
                detail_ring_capacity: 4,
                global_ring_capacity: 64,
            },
            ..SessionConfig::default()
        };
        config.drain.stall_timeout_ms = 60_000;
        let session = Arc::new(Session::create(config).unwrap());
        session.start();
        session
    }

    #[test]
    fn test_mode_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path(), &dir.path().join("out"));
        let mut drain = DrainWorker::new(Arc::clone(&session)).unwrap();
        assert_eq!(session.control().mode(), SessionMode::GlobalOnly);
        drain.run_pass(MS).unwrap();
        assert_eq!(session.control().mode(), SessionMode::DualWrite);
        drain.run_pass(2 * MS).unwrap();
        drain.run_pass(3 * MS).unwrap();
        assert_eq!(session.control().mode(), SessionMode::PerThreadOnly);

        // A pass far beyond the stall timeout demotes
        drain.run_pass(3 * MS + 61_000 * MS).unwrap();
        assert_eq!(drain.stats().stalls_detected, 1);
        assert_eq!(session.control().mode(), SessionMode::DualWrite);
    }

    #[test]
    fn test_global_lane_events_persist_and_mirrors_do_not() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let session = session(dir.path(), &out);
        let tracer = Tracer::new(Arc::clone(&session));
        let mut drain = DrainWorker::new(Arc::clone(&session)).unwrap();

        // No heartbeat yet: shared lane only
        assert!(tracer.on_occurrence(ThreadId(1), FunctionId(1), EventKind::Call, 1, None));
        drain.run_pass(clock::now_ns()).unwrap();
        assert_eq!(session.control().mode(), SessionMode::DualWrite);

        // Dual write: thread lane + mirror
        assert!(tracer.on_occurrence(ThreadId(1), FunctionId(1), EventKind::Return, 2, None));
        drain.run_pass(clock::now_ns()).unwrap();
        let report = drain.finalize(clock::now_ns()).unwrap();

        assert_eq!(report.summary.index_events, 2);
        assert_eq!(report.stats.global_events_written, 1);
        assert_eq!(report.stats.mirrored_discarded, 1);
        assert!(out.join("session.json").exists());
        assert_eq!(TraceReader::open(&out).unwrap().events.len(), 2);
    }

    #[test]
    fn test_orphans_and_filtered_details() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let session = session(dir.path(), &out);
        let mut drain = DrainWorker::new(Arc::clone(&session)).unwrap();
        for pass in 1..=3 {
            drain.run_pass(pass * MS).unwrap();
        }
        let slot = session.registry().register(ThreadId(5)).unwrap();
        let index = slot.index_lane().active_ring().unwrap();
        let detail = slot.detail_lane().active_ring().unwrap();

        let linked = |ts: u64, seq: u32| IndexEvent {
            timestamp_ns: ts,
            function_id: 1,
            thread_id: 5,
            event_kind: EventKind::Call.as_raw(),
            call_depth: 0,
            detail_seq: seq,
        };
        // Detail 0 has no index event; detail 1 pairs; index 2 has no detail
        detail.write_record(&DetailRecord::new(&linked(1, 0), 0, 0, b"x"));
        detail.write_record(&DetailRecord::new(&linked(2, 1), 1, 1, b"y"));
        index.write_record(&linked(2, 1));
        index.write_record(&linked(3, 2));

        session.control().disarm_window();
        let report = drain.finalize(4 * MS).unwrap();
        assert_eq!(report.summary.index_events, 2);
        assert_eq!(report.summary.detail_events, 0);
        assert_eq!(report.stats.orphan_details, 1);
        assert_eq!(report.stats.filtered_details, 1);
        assert_eq!(report.stats.missing_details, 1);
    }

    #[test]
    fn test_seq_before_wraps() {
        assert!(seq_before(1, 2));
        assert!(!seq_before(2, 2));
        assert!(seq_before(u32::MAX - 1, 0));
        assert!(!seq_before(0, u32::MAX - 1));
    }

    #[test]
    fn test_pairing_across_detail_seq_wrap() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let session = session(dir.path(), &out);
        let mut drain = DrainWorker::new(Arc::clone(&session)).unwrap();
        for pass in 1..=3 {
            drain.run_pass(pass * MS).unwrap();
        }
        let slot = session.registry().register(ThreadId(6)).unwrap();
        let index = slot.index_lane().active_ring().unwrap();
        let detail = slot.detail_lane().active_ring().unwrap();
        let event = |ts: u64, seq: u32| IndexEvent {
            timestamp_ns: ts,
            function_id: 1,
            thread_id: 6,
            event_kind: EventKind::Call.as_raw(),
            call_depth: 0,
            detail_seq: seq,
        };

        // The detail for the last sequence before the wrap was lost; the first
        // one after it must still pair instead of being taken for an orphan
        index.write_record(&event(1, u32::MAX - 1));
        index.write_record(&event(2, 0));
        detail.write_record(&DetailRecord::new(&event(2, 0), 1, 0, b"after-wrap"));

        let report = drain.finalize(4 * MS).unwrap();
        assert_eq!(report.summary.index_events, 2);
        assert_eq!(report.summary.linked_events, 1);
        assert_eq!(report.stats.missing_details, 1);
        assert_eq!(report.stats.orphan_details, 0);
        let reader = TraceReader::open(&out).unwrap();
        assert_eq!(reader.detail_events()[0].payload, b"after-wrap");
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path(), &dir.path().join("out"));
        let mut drain = DrainWorker::new(Arc::clone(&session)).unwrap();
        let first = drain.finalize(MS).unwrap();
        let second = drain.finalize(2 * MS).unwrap();
        assert_eq!(first.summary, second.summary);
        assert_eq!(session.control().state(), SessionState::Finished);
        assert!(matches!(drain.run_pass(3 * MS), Err(SessionError::AlreadyFinalized(_))));
    }
}
