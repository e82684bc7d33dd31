//! Backpressure controller for one lane
//!
//! ```text
//!            free ≤ low / exhaustion        exhaustion
//!   Normal ─────────────────────────▶ Pressure ───────────▶ Dropping
//!     ▲                                 ▲   │                  │
//!     │ stable ≥ high for window   dip  │   │ free > high      │ free ≥ high
//!     │                                 │   ▼                  ▼
//!     └──────────────────────────────── Recovery ◀─────────────┘
//!                                          │ exhaustion
//!                                          └──────────▶ Dropping
//! ```
//!
//! Both the owning producer (on ring swaps and exhaustion) and the drain (its
//! recovery check after returning rings) drive transitions, so every
//! transition is a compare-and-swap on the shared state word.

use crate::shm::SharedLayout;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Lane pressure state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureState {
    Normal,
    Pressure,
    Dropping,
    Recovery,
}

impl PressureState {
    fn as_raw(self) -> u32 {
        match self {
            PressureState::Normal => 0,
            PressureState::Pressure => 1,
            PressureState::Dropping => 2,
            PressureState::Recovery => 3,
        }
    }

    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => PressureState::Pressure,
            2 => PressureState::Dropping,
            3 => PressureState::Recovery,
            _ => PressureState::Normal,
        }
    }
}

/// What gets sacrificed when a lane is out of rings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Reject the incoming event and keep the backlog
    #[default]
    DropNewest,
    /// Reject the incoming event and let the drain shed the oldest submitted
    /// rings so newer data survives
    DropOldest,
}

/// Shared-memory state of one lane's controller
#[repr(C)]
pub struct BackpressureShm {
    state: AtomicU32,
    low_watermark: AtomicU32,
    high_watermark: AtomicU32,
    _reserved: AtomicU32,
    stability_window_ns: AtomicU64,
    recovery_started_ns: AtomicU64,
    dropped_events: AtomicU64,
    dropped_bytes: AtomicU64,
    exhaustion_count: AtomicU64,
    transitions: AtomicU64,
    /// Written by the drain only
    shed_events: AtomicU64,
}

// SAFETY: repr(C), atomics only, zero is Normal with zero thresholds
unsafe impl SharedLayout for BackpressureShm {}

/// Watermarks in free rings, derived from a lane's ring count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: u32,
    pub high: u32,
}

impl Watermarks {
    /// Derive thresholds from percentages of the free-ring capacity
    /// (`ring_count - 1`). `high` is kept above `low` and within capacity.
    #[must_use]
    pub fn for_lane(ring_count: u32, low_pct: u8, high_pct: u8) -> Self {
        let max_free = ring_count.saturating_sub(1);
        let low = max_free * u32::from(low_pct) / 100;
        let high = (max_free * u32::from(high_pct)).div_ceil(100);
        let high = high.max(low + 1).min(max_free.max(1));
        Self { low: low.min(high.saturating_sub(1)), high }
    }
}

/// Counters exposed to metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackpressureSnapshot {
    pub state_transitions: u64,
    pub dropped_events: u64,
    pub dropped_bytes: u64,
    pub exhaustion_count: u64,
    pub shed_events: u64,
}

/// Handle onto a lane's controller
#[derive(Clone, Copy)]
pub struct Backpressure<'a> {
    shm: &'a BackpressureShm,
}

impl<'a> Backpressure<'a> {
    #[must_use]
    pub fn new(shm: &'a BackpressureShm) -> Self {
        Self { shm }
    }

    /// Reset to `Normal` with the given thresholds. Registration only.
    pub(crate) fn init(&self, marks: Watermarks, stability_window_ns: u64) {
        self.shm.low_watermark.store(marks.low, Ordering::Relaxed);
        self.shm.high_watermark.store(marks.high, Ordering::Relaxed);
        self.shm.stability_window_ns.store(stability_window_ns, Ordering::Relaxed);
        self.shm.recovery_started_ns.store(0, Ordering::Relaxed);
        for counter in [
            &self.shm.dropped_events,
            &self.shm.dropped_bytes,
            &self.shm.exhaustion_count,
            &self.shm.transitions,
            &self.shm.shed_events,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.shm.state.store(PressureState::Normal.as_raw(), Ordering::Release);
    }

    #[must_use]
    pub fn state(&self) -> PressureState {
        PressureState::from_raw(self.shm.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn watermarks(&self) -> Watermarks {
        Watermarks {
            low: self.shm.low_watermark.load(Ordering::Relaxed),
            high: self.shm.high_watermark.load(Ordering::Relaxed),
        }
    }

    fn transition(&self, from: PressureState, to: PressureState) -> bool {
        let swapped = self
            .shm
            .state
            .compare_exchange(from.as_raw(), to.as_raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.shm.transitions.fetch_add(1, Ordering::Relaxed);
        }
        swapped
    }

    /// Enter recovery and start the stability timer
    fn begin_recovery(&self, from: PressureState, now_ns: u64) -> bool {
        // Timer first: whoever observes Recovery also observes its start
        self.shm.recovery_started_ns.store(now_ns, Ordering::Release);
        self.transition(from, PressureState::Recovery)
    }

    /// Feed an observation of the lane's free-ring depth. Returns the state
    /// after any transition.
    pub fn sample(&self, free_depth: u32, now_ns: u64) -> PressureState {
        let marks = self.watermarks();
        let state = self.state();
        match state {
            PressureState::Normal => {
                if free_depth <= marks.low {
                    self.transition(state, PressureState::Pressure);
                }
            }
            PressureState::Pressure => {
                if free_depth >= marks.high && free_depth > marks.low {
                    self.begin_recovery(state, now_ns);
                }
            }
            PressureState::Dropping => {
                if free_depth >= marks.high {
                    self.begin_recovery(state, now_ns);
                }
            }
            PressureState::Recovery => {
                if free_depth < marks.high {
                    // Transient dip: the window starts over on the next climb
                    self.transition(state, PressureState::Pressure);
                } else {
                    let started = self.shm.recovery_started_ns.load(Ordering::Acquire);
                    let window = self.shm.stability_window_ns.load(Ordering::Relaxed);
                    if now_ns.saturating_sub(started) >= window {
                        self.transition(state, PressureState::Normal);
                    }
                }
            }
        }
        self.state()
    }

    /// The producer found no free ring. Returns the state after transition.
    pub fn on_exhaustion(&self) -> PressureState {
        self.shm.exhaustion_count.fetch_add(1, Ordering::Relaxed);
        let state = self.state();
        match state {
            PressureState::Normal => {
                self.transition(state, PressureState::Pressure);
            }
            PressureState::Pressure | PressureState::Recovery => {
                self.transition(state, PressureState::Dropping);
            }
            PressureState::Dropping => {}
        }
        self.state()
    }

    /// Count one rejected event of `bytes` bytes
    pub fn on_drop(&self, bytes: u64) {
        self.shm.dropped_events.fetch_add(1, Ordering::Relaxed);
        self.shm.dropped_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Drain only: count events discarded by oldest-first shedding
    pub fn on_shed(&self, events: u64, bytes: u64) {
        self.shm.shed_events.fetch_add(events, Ordering::Relaxed);
        self.shm.dropped_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Whether the producer may spin briefly for a free ring before dropping
    #[must_use]
    pub fn admits_retry(&self) -> bool {
        matches!(self.state(), PressureState::Normal | PressureState::Pressure)
    }

    #[must_use]
    pub fn snapshot(&self) -> BackpressureSnapshot {
        BackpressureSnapshot {
            state_transitions: self.shm.transitions.load(Ordering::Relaxed),
            dropped_events: self.shm.dropped_events.load(Ordering::Relaxed),
            dropped_bytes: self.shm.dropped_bytes.load(Ordering::Relaxed),
            exhaustion_count: self.shm.exhaustion_count.load(Ordering::Relaxed),
            shed_events: self.shm.shed_events.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::ShmSegment;

    const WINDOW: u64 = 1_000;

    fn controller(seg: &ShmSegment) -> Backpressure<'_> {
        let bp = Backpressure::new(seg.view(0).unwrap());
        bp.init(Watermarks { low: 1, high: 3 }, WINDOW);
        bp
    }

    #[test]
    fn test_watermarks_for_lane() {
        assert_eq!(Watermarks::for_lane(4, 25, 75), Watermarks { low: 0, high: 3 });
        assert_eq!(Watermarks::for_lane(2, 25, 75), Watermarks { low: 0, high: 1 });
        assert_eq!(Watermarks::for_lane(8, 50, 50), Watermarks { low: 3, high: 4 });
    }

    #[test]
    fn test_full_cycle() {
        let seg = ShmSegment::anonymous("/bp", 4096).unwrap();
        let bp = controller(&seg);

        assert_eq!(bp.sample(1, 0), PressureState::Pressure);
        assert_eq!(bp.on_exhaustion(), PressureState::Dropping);
        assert_eq!(bp.sample(2, 10), PressureState::Dropping);
        assert_eq!(bp.sample(3, 20), PressureState::Recovery);
        assert_eq!(bp.sample(3, 20 + WINDOW - 1), PressureState::Recovery);
        assert_eq!(bp.sample(3, 20 + WINDOW), PressureState::Normal);
        assert_eq!(bp.snapshot().state_transitions, 4);
    }

    #[test]
    fn test_dip_during_recovery_restarts_window() {
        let seg = ShmSegment::anonymous("/bp", 4096).unwrap();
        let bp = controller(&seg);
        bp.on_exhaustion();
        bp.on_exhaustion();
        assert_eq!(bp.state(), PressureState::Dropping);

        assert_eq!(bp.sample(3, 0), PressureState::Recovery);
        assert_eq!(bp.sample(2, 500), PressureState::Pressure);
        assert_eq!(bp.sample(3, 600), PressureState::Recovery);
        // The original window would have elapsed here
        assert_eq!(bp.sample(3, 1_100), PressureState::Recovery);
        assert_eq!(bp.sample(3, 1_600), PressureState::Normal);
    }

    #[test]
    fn test_exhaustion_in_recovery_drops() {
        let seg = ShmSegment::anonymous("/bp", 4096).unwrap();
        let bp = controller(&seg);
        bp.on_exhaustion();
        bp.on_exhaustion();
        bp.sample(3, 0);
        assert_eq!(bp.on_exhaustion(), PressureState::Dropping);
        assert!(!bp.admits_retry());
    }

    #[test]
    fn test_drop_counters() {
        let seg = ShmSegment::anonymous("/bp", 4096).unwrap();
        let bp = controller(&seg);
        bp.on_drop(32);
        bp.on_drop(32);
        bp.on_shed(10, 320);
        let snap = bp.snapshot();
        assert_eq!(snap.dropped_events, 2);
        assert_eq!(snap.dropped_bytes, 384);
        assert_eq!(snap.shed_events, 10);
    }
}
