//! # Event ingress
//!
//! [`Tracer::on_occurrence`] is the single entry point the instrumentation
//! layer calls. It never blocks and never panics: every failure (registry
//! full, lane disabled, pool exhausted) ends in `false` and a counter.
//!
//! ## Producer path
//!
//! ```text
//! on_occurrence ──▶ effective mode ──┬─ GlobalOnly ────▶ global lane
//!                                    ├─ DualWrite ─────▶ thread lanes + mirror
//!                                    └─ PerThreadOnly ─▶ thread lanes
//!
//! thread lanes: detail record (optional) ──▶ index event carrying its detail_seq
//! ```
//!
//! A full active ring is swapped for a free one. With no free ring the
//! producer spins a bounded number of times while the lane admits retries,
//! then reports exhaustion to the backpressure controller and drops.

use crate::backpressure::PressureState;
use crate::clock;
use crate::domain::{EventKind, FunctionId, SessionId, SessionMode, SlotIndex, ThreadId};
use crate::registry::{LaneKind, ThreadSlot};
use crate::session::Session;
use ada_tracer_common::{bytes_of, DetailRecord, GlobalRecord, IndexEvent, Pod, GLOBAL_FLAG_MIRRORED, NO_DETAIL_SEQ};
use std::cell::Cell;
use std::sync::Arc;

/// One function-level occurrence handed over by instrumentation
#[derive(Debug, Clone, Copy)]
pub struct Occurrence<'a> {
    pub thread_id: ThreadId,
    pub function_id: FunctionId,
    pub kind: EventKind,
    pub timestamp_ns: u64,
    /// Register/stack snapshot to persist in the detail stream
    pub detail: Option<&'a [u8]>,
}

/// Anything that accepts occurrences
pub trait OccurrenceSink {
    /// Returns whether the occurrence was captured
    fn on_occurrence(&self, occurrence: &Occurrence<'_>) -> bool;
}

/// Per-OS-thread cache of the last registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ThreadHandle {
    session_id: SessionId,
    thread_id: ThreadId,
    slot: SlotIndex,
}

thread_local! {
    static HANDLE: Cell<Option<ThreadHandle>> = const { Cell::new(None) };
}

/// Producer front end of a session, cheap to clone into every traced thread
#[derive(Debug, Clone)]
pub struct Tracer {
    session: Arc<Session>,
    spin_limit: u32,
}

impl Tracer {
    #[must_use]
    pub fn new(session: Arc<Session>) -> Self {
        let spin_limit = session.config().backpressure.pressure_spin_limit;
        Self { session, spin_limit }
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Resolve the caller's slot, revalidating the cached handle
    fn slot_for(&self, thread_id: ThreadId) -> Option<ThreadSlot<'_>> {
        let registry = self.session.registry();
        let session_id = registry.session_id();
        let cached = HANDLE.with(Cell::get).filter(|h| h.session_id == session_id && h.thread_id == thread_id);
        if let Some(handle) = cached {
            if let Some(slot) = registry.slot(handle.slot) {
                if slot.is_active() && slot.thread_id() == thread_id {
                    return Some(slot);
                }
            }
        }
        let slot = registry.register(thread_id)?;
        HANDLE.with(|h| h.set(Some(ThreadHandle { session_id, thread_id, slot: slot.index() })));
        Some(slot)
    }

    /// Release the caller's slot; further occurrences from this thread id
    /// claim a fresh one
    pub fn thread_exit(&self, thread_id: ThreadId) -> bool {
        let Some(slot) = self.session.registry().lookup(thread_id) else {
            return false;
        };
        HANDLE.with(|h| {
            if h.get().is_some_and(|cached| cached.thread_id == thread_id) {
                h.set(None);
            }
        });
        self.session.registry().unregister(slot.index())
    }

    /// Capture one occurrence. See [`OccurrenceSink`].
    pub fn on_occurrence(
        &self,
        thread_id: ThreadId,
        function_id: FunctionId,
        kind: EventKind,
        timestamp_ns: u64,
        detail: Option<&[u8]>,
    ) -> bool {
        let control = self.session.control();
        if control.shutdown_requested() {
            return false;
        }
        let now = clock::now_ns();
        let mode = control.effective_mode(now);
        let slot = self.slot_for(thread_id);

        let call_depth = slot.map_or(0, |slot| advance_depth(&slot, kind));
        let event = IndexEvent {
            timestamp_ns,
            function_id: function_id.0,
            thread_id: thread_id.0,
            event_kind: kind.as_raw(),
            call_depth,
            detail_seq: NO_DETAIL_SEQ,
        };

        match mode {
            SessionMode::GlobalOnly => {
                let admitted = self.session.global_lane().try_write(&GlobalRecord { event, ..GlobalRecord::default() });
                if let Some(slot) = slot {
                    record_outcome(&slot, admitted, std::mem::size_of::<GlobalRecord>());
                    if detail.is_some() {
                        slot.metrics().record_filtered();
                    }
                }
                admitted
            }
            SessionMode::DualWrite => {
                let Some(slot) = slot else {
                    return false;
                };
                let written = self.write_lanes(&slot, event, detail, now);
                let mirror = GlobalRecord { event, flags: GLOBAL_FLAG_MIRRORED, ..GlobalRecord::default() };
                if !self.session.global_lane().try_write(&mirror) {
                    slot.metrics().record_mirror_failure();
                }
                written
            }
            SessionMode::PerThreadOnly => slot.is_some_and(|slot| self.write_lanes(&slot, event, detail, now)),
        }
    }

    /// Detail first, so the drain never sees an index link before its target
    fn write_lanes(&self, slot: &ThreadSlot<'_>, mut event: IndexEvent, detail: Option<&[u8]>, now: u64) -> bool {
        let control = self.session.control();
        if !control.index_lane_enabled() {
            slot.metrics().record_filtered();
            return false;
        }
        let index_seq = slot.next_index_seq();

        if let Some(payload) = detail {
            if control.detail_lane_enabled() {
                let detail_seq = slot.next_detail_seq();
                let record = DetailRecord::new(&event, index_seq, detail_seq, payload);
                if self.push(slot, LaneKind::Detail, &record, now) {
                    event.detail_seq = detail_seq;
                }
            } else {
                slot.metrics().record_filtered();
            }
        }
        self.push(slot, LaneKind::Index, &event, now)
    }

    fn push<T: Pod>(&self, slot: &ThreadSlot<'_>, kind: LaneKind, record: &T, now: u64) -> bool {
        let lane = slot.lane(kind);
        let pressure = slot.backpressure(kind);
        let metrics = slot.metrics();
        let bytes = bytes_of(record).len();

        if pressure.state() == PressureState::Dropping {
            pressure.on_drop(bytes as u64);
            record_outcome(slot, false, bytes);
            return false;
        }
        let Some(ring) = lane.active_ring() else {
            metrics.record_allocation_failure();
            pressure.on_drop(bytes as u64);
            record_outcome(slot, false, bytes);
            return false;
        };
        if ring.write_record(record) {
            record_outcome(slot, true, bytes);
            return true;
        }
        metrics.record_ring_full();

        let mut spins = 0;
        loop {
            let token = metrics.begin_swap(now);
            if lane.swap_active_ring().is_some() {
                metrics.end_swap(token, clock::now_ns());
                pressure.sample(lane.free_depth(), now);
                let written = lane.active_ring().is_some_and(|ring| ring.write_record(record));
                if written {
                    record_outcome(slot, true, bytes);
                    return true;
                }
                break;
            }
            if spins >= self.spin_limit || !pressure.admits_retry() {
                metrics.record_pool_exhaustion();
                pressure.on_exhaustion();
                break;
            }
            spins += 1;
            std::hint::spin_loop();
        }
        pressure.on_drop(bytes as u64);
        record_outcome(slot, false, bytes);
        false
    }
}

impl OccurrenceSink for Tracer {
    fn on_occurrence(&self, occurrence: &Occurrence<'_>) -> bool {
        Tracer::on_occurrence(
            self,
            occurrence.thread_id,
            occurrence.function_id,
            occurrence.kind,
            occurrence.timestamp_ns,
            occurrence.detail,
        )
    }
}

/// Depth recorded for this event; calls nest one level deeper afterwards
fn advance_depth(slot: &ThreadSlot<'_>, kind: EventKind) -> u32 {
    let depth = slot.call_depth();
    match kind {
        EventKind::Call => {
            slot.set_call_depth(depth.saturating_add(1));
            depth
        }
        EventKind::Return | EventKind::Exception => {
            let depth = depth.saturating_sub(1);
            slot.set_call_depth(depth);
            depth
        }
    }
}

fn record_outcome(slot: &ThreadSlot<'_>, written: bool, bytes: usize) {
    if written {
        slot.metrics().record_written(bytes as u64);
    } else {
        slot.metrics().record_dropped();
    }
}
