//! # Thread Registry
//!
//! A fixed arena of [`ThreadLaneSet`] slots plus their ring pools, all inside
//! one shared segment and located purely by offsets from the segment base.
//!
//! ## Segment layout
//!
//! ```text
//! 0                slots_offset                     arena_offset
//! ┌────────────────┬───────────┬───────────┬───┬────┬─────────────────────────────┐
//! │ RegistryHeader │ slot 0    │ slot 1    │...│    │ slot 0 rings │ slot 1 rings │
//! │                │ (lanes,   │           │   │    │ idx0..idxN   │ ...          │
//! │                │  metrics) │           │   │    │ det0..detM   │              │
//! └────────────────┴───────────┴───────────┴───┴────┴─────────────────────────────┘
//! ```
//!
//! Allocation is a bounded atomic increment of a cursor; slots are published
//! with a release store of their state and never reused within a session.
//! Both processes map the segment at different addresses, so the header and
//! every ring descriptor store offsets only; [`ThreadRegistry::dump`] exposes
//! them so tests can check that nothing resembling an address is stored.

use crate::backpressure::{Backpressure, BackpressureShm, Watermarks};
use crate::config::{BackpressureConfig, RegistryConfig, MAX_THREADS};
use crate::domain::{SessionId, SetupError, SlotIndex, ThreadId};
use crate::lane::{Lane, LaneShm, MAX_RINGS_PER_LANE, MIN_RINGS_PER_LANE};
use crate::metrics::ThreadMetrics;
use crate::ring::{ring_bytes, RingBuffer};
use crate::shm::{align_up, RootedSegment, SharedLayout, ShmSegment, LAYOUT_ALIGN};
use ada_tracer_common::{DetailRecord, IndexEvent, NO_DETAIL_SEQ};
use log::debug;
use serde::Serialize;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// "ADRG"
pub const REGISTRY_MAGIC: u32 = 0x4144_5247;
pub const REGISTRY_VERSION: u32 = 1;

#[allow(clippy::cast_possible_truncation)]
const INDEX_ELEMENT: u32 = size_of::<IndexEvent>() as u32;
#[allow(clippy::cast_possible_truncation)]
const DETAIL_ELEMENT: u32 = size_of::<DetailRecord>() as u32;

#[repr(C)]
pub struct RegistryHeader {
    magic: AtomicU32,
    version: AtomicU32,
    capacity: AtomicU32,
    accepting: AtomicU32,
    cursor: AtomicU32,
    shutdown: AtomicU32,
    index_rings: AtomicU32,
    index_ring_capacity: AtomicU32,
    detail_rings: AtomicU32,
    detail_ring_capacity: AtomicU32,
    low_watermark_pct: AtomicU32,
    high_watermark_pct: AtomicU32,
    stability_window_ns: AtomicU64,
    registration_failures: AtomicU64,
    session_id: AtomicU64,
    slots_offset: AtomicU64,
    slot_stride: AtomicU64,
    arena_offset: AtomicU64,
    arena_stride: AtomicU64,
    segment_size: AtomicU64,
}

// SAFETY: repr(C), atomics only, zero is an unpublished header
unsafe impl SharedLayout for RegistryHeader {}

/// Lifecycle of a registry slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Vacant,
    Active,
    Inactive,
}

impl SlotState {
    fn as_raw(self) -> u32 {
        match self {
            SlotState::Vacant => 0,
            SlotState::Active => 1,
            SlotState::Inactive => 2,
        }
    }

    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => SlotState::Active,
            2 => SlotState::Inactive,
            _ => SlotState::Vacant,
        }
    }
}

/// Everything one traced thread owns in shared memory
#[repr(C)]
pub struct ThreadLaneSet {
    thread_id: AtomicU32,
    slot_index: AtomicU32,
    state: AtomicU32,
    call_depth: AtomicU32,
    next_index_seq: AtomicU32,
    next_detail_seq: AtomicU32,
    _reserved: [AtomicU32; 2],
    index_lane: LaneShm,
    detail_lane: LaneShm,
    index_pressure: BackpressureShm,
    detail_pressure: BackpressureShm,
    metrics: ThreadMetrics,
}

// SAFETY: repr(C) composition of SharedLayout types and atomics
unsafe impl SharedLayout for ThreadLaneSet {}

/// Which of a thread's two lanes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneKind {
    Index,
    Detail,
}

/// Offsets and sizes derived from a [`RegistryConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLayout {
    pub capacity: u32,
    pub index_rings: u32,
    pub index_ring_capacity: u32,
    pub detail_rings: u32,
    pub detail_ring_capacity: u32,
    pub slots_offset: u64,
    pub slot_stride: u64,
    pub arena_offset: u64,
    pub arena_stride: u64,
    pub index_ring_bytes: u64,
    pub detail_ring_bytes: u64,
    pub segment_size: u64,
}

impl RegistryLayout {
    #[must_use]
    pub fn new(config: &RegistryConfig) -> Self {
        Self::from_params(
            config.max_threads,
            config.index_rings,
            config.index_ring_capacity,
            config.detail_rings,
            config.detail_ring_capacity,
        )
    }

    fn from_params(capacity: u32, index_rings: u32, index_cap: u32, detail_rings: u32, detail_cap: u32) -> Self {
        let slots_offset = align_up(size_of::<RegistryHeader>() as u64, LAYOUT_ALIGN);
        let slot_stride = align_up(size_of::<ThreadLaneSet>() as u64, LAYOUT_ALIGN);
        let arena_offset = slots_offset + slot_stride * u64::from(capacity);
        let index_ring_bytes = ring_bytes(index_cap, INDEX_ELEMENT);
        let detail_ring_bytes = ring_bytes(detail_cap, DETAIL_ELEMENT);
        let arena_stride =
            index_ring_bytes * u64::from(index_rings) + detail_ring_bytes * u64::from(detail_rings);
        Self {
            capacity,
            index_rings,
            index_ring_capacity: index_cap,
            detail_rings,
            detail_ring_capacity: detail_cap,
            slots_offset,
            slot_stride,
            arena_offset,
            arena_stride,
            index_ring_bytes,
            detail_ring_bytes,
            segment_size: arena_offset + arena_stride * u64::from(capacity),
        }
    }

    /// Offset of a slot's lane set
    #[must_use]
    pub fn slot_offset(&self, slot: u32) -> u64 {
        self.slots_offset + self.slot_stride * u64::from(slot)
    }

    /// Offset of ring `ring` of a slot's lane
    #[must_use]
    pub fn ring_offset(&self, slot: u32, lane: LaneKind, ring: u32) -> u64 {
        let base = self.arena_offset + self.arena_stride * u64::from(slot);
        match lane {
            LaneKind::Index => base + self.index_ring_bytes * u64::from(ring),
            LaneKind::Detail => {
                base + self.index_ring_bytes * u64::from(self.index_rings) + self.detail_ring_bytes * u64::from(ring)
            }
        }
    }

    fn lane_rings(&self, slot: u32, lane: LaneKind) -> Vec<(u64, u64)> {
        let (count, bytes) = match lane {
            LaneKind::Index => (self.index_rings, self.index_ring_bytes),
            LaneKind::Detail => (self.detail_rings, self.detail_ring_bytes),
        };
        (0..count).map(|ring| (self.ring_offset(slot, lane, ring), bytes)).collect()
    }
}

/// One stored offset/size pair found by [`ThreadRegistry::dump`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DumpEntry {
    pub label: String,
    pub offset: u64,
    pub size: u64,
}

/// Every offset the registry stores, for cross-process addressing checks
#[derive(Debug, Clone, Serialize)]
pub struct RegistryDump {
    pub segment_size: u64,
    pub entries: Vec<DumpEntry>,
}

impl RegistryDump {
    /// Entries whose range does not lie inside `[0, segment_size)`
    #[must_use]
    pub fn out_of_range(&self) -> Vec<&DumpEntry> {
        self.entries
            .iter()
            .filter(|e| e.offset >= self.segment_size || e.offset.saturating_add(e.size) > self.segment_size)
            .collect()
    }
}

/// Handle onto one registered thread's lane set
#[derive(Clone, Copy)]
pub struct ThreadSlot<'a> {
    shm: &'a ThreadLaneSet,
    segment: &'a ShmSegment,
    index: SlotIndex,
}

impl<'a> ThreadSlot<'a> {
    #[must_use]
    pub fn index(&self) -> SlotIndex {
        self.index
    }

    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        ThreadId(self.shm.thread_id.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn state(&self) -> SlotState {
        SlotState::from_raw(self.shm.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == SlotState::Active
    }

    #[must_use]
    pub fn lane(&self, kind: LaneKind) -> Lane<'a> {
        match kind {
            LaneKind::Index => Lane::new(&self.shm.index_lane, self.segment),
            LaneKind::Detail => Lane::new(&self.shm.detail_lane, self.segment),
        }
    }

    #[must_use]
    pub fn index_lane(&self) -> Lane<'a> {
        self.lane(LaneKind::Index)
    }

    #[must_use]
    pub fn detail_lane(&self) -> Lane<'a> {
        self.lane(LaneKind::Detail)
    }

    #[must_use]
    pub fn backpressure(&self, kind: LaneKind) -> Backpressure<'a> {
        match kind {
            LaneKind::Index => Backpressure::new(&self.shm.index_pressure),
            LaneKind::Detail => Backpressure::new(&self.shm.detail_pressure),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &'a ThreadMetrics {
        &self.shm.metrics
    }

    /// Producer: next index sequence (always advances)
    pub fn next_index_seq(&self) -> u32 {
        self.shm.next_index_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Producer: next detail sequence (advances only when a detail is sent).
    /// Wraps to 0 before reaching [`NO_DETAIL_SEQ`].
    pub fn next_detail_seq(&self) -> u32 {
        let seq = self.shm.next_detail_seq.load(Ordering::Relaxed);
        let next = match seq.wrapping_add(1) {
            NO_DETAIL_SEQ => 0,
            next => next,
        };
        self.shm.next_detail_seq.store(next, Ordering::Relaxed);
        seq
    }

    #[must_use]
    pub fn call_depth(&self) -> u32 {
        self.shm.call_depth.load(Ordering::Relaxed)
    }

    pub fn set_call_depth(&self, depth: u32) {
        self.shm.call_depth.store(depth, Ordering::Relaxed);
    }
}

/// The registry segment plus its derived layout
pub struct ThreadRegistry {
    segment: RootedSegment<RegistryHeader>,
    layout: RegistryLayout,
}

impl std::fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("segment", self.segment.segment())
            .field("layout", &self.layout)
            .finish()
    }
}

impl ThreadRegistry {
    /// Bytes a registry segment needs for `config`
    #[must_use]
    pub fn required_size(config: &RegistryConfig) -> u64 {
        RegistryLayout::new(config).segment_size
    }

    /// Lay out a fresh registry in `segment`, creating every ring up front
    pub fn create(
        segment: ShmSegment,
        config: &RegistryConfig,
        backpressure: &BackpressureConfig,
        session_id: SessionId,
    ) -> Result<Self, SetupError> {
        let layout = RegistryLayout::new(config);
        if config.max_threads == 0 || config.max_threads > MAX_THREADS {
            return Err(SetupError::InvalidConfig(format!("max_threads {} out of range", config.max_threads)));
        }
        let rings = MIN_RINGS_PER_LANE..=MAX_RINGS_PER_LANE;
        if !rings.contains(&(config.index_rings as usize)) || !rings.contains(&(config.detail_rings as usize)) {
            return Err(SetupError::InvalidConfig(format!(
                "lanes need {MIN_RINGS_PER_LANE} to {MAX_RINGS_PER_LANE} rings"
            )));
        }
        if segment.len() < layout.segment_size {
            return Err(SetupError::RegionTooSmall { needed: layout.segment_size, available: segment.len() });
        }

        let segment = RootedSegment::<RegistryHeader>::new(segment)?;
        let seg = segment.segment();
        for slot in 0..layout.capacity {
            let set: &ThreadLaneSet = seg.view(layout.slot_offset(slot))?;
            for (kind, element, capacity, lane) in [
                (LaneKind::Index, INDEX_ELEMENT, layout.index_ring_capacity, &set.index_lane),
                (LaneKind::Detail, DETAIL_ELEMENT, layout.detail_ring_capacity, &set.detail_lane),
            ] {
                let rings = layout.lane_rings(slot, kind);
                for &(offset, bytes) in &rings {
                    RingBuffer::create(seg.region(offset, bytes)?, capacity, element)?;
                }
                lane.configure(element, &rings);
            }
        }

        let header = segment.root();
        header.version.store(REGISTRY_VERSION, Ordering::Relaxed);
        header.capacity.store(layout.capacity, Ordering::Relaxed);
        header.cursor.store(0, Ordering::Relaxed);
        header.shutdown.store(0, Ordering::Relaxed);
        header.index_rings.store(layout.index_rings, Ordering::Relaxed);
        header.index_ring_capacity.store(layout.index_ring_capacity, Ordering::Relaxed);
        header.detail_rings.store(layout.detail_rings, Ordering::Relaxed);
        header.detail_ring_capacity.store(layout.detail_ring_capacity, Ordering::Relaxed);
        header.low_watermark_pct.store(u32::from(backpressure.low_watermark_pct), Ordering::Relaxed);
        header.high_watermark_pct.store(u32::from(backpressure.high_watermark_pct), Ordering::Relaxed);
        header
            .stability_window_ns
            .store(backpressure.stability_window_ms.saturating_mul(1_000_000), Ordering::Relaxed);
        header.session_id.store(session_id.0, Ordering::Relaxed);
        header.slots_offset.store(layout.slots_offset, Ordering::Relaxed);
        header.slot_stride.store(layout.slot_stride, Ordering::Relaxed);
        header.arena_offset.store(layout.arena_offset, Ordering::Relaxed);
        header.arena_stride.store(layout.arena_stride, Ordering::Relaxed);
        header.segment_size.store(layout.segment_size, Ordering::Relaxed);
        header.accepting.store(1, Ordering::Relaxed);
        header.magic.store(REGISTRY_MAGIC, Ordering::Release);

        debug!("registry created: {} slots, {} bytes", layout.capacity, layout.segment_size);
        Ok(Self { segment, layout })
    }

    /// Attach to a registry created elsewhere, validating the header and every
    /// stored offset before trusting any of it
    pub fn attach(segment: ShmSegment) -> Result<Self, SetupError> {
        let segment = RootedSegment::<RegistryHeader>::new(segment)?;
        let header = segment.root();

        let magic = header.magic.load(Ordering::Acquire);
        if magic != REGISTRY_MAGIC {
            return Err(SetupError::BadMagic { what: "registry header", expected: REGISTRY_MAGIC, found: magic });
        }
        let version = header.version.load(Ordering::Relaxed);
        if version != REGISTRY_VERSION {
            return Err(SetupError::VersionMismatch { what: "registry", expected: REGISTRY_VERSION, found: version });
        }

        let capacity = header.capacity.load(Ordering::Relaxed);
        let index_rings = header.index_rings.load(Ordering::Relaxed);
        let detail_rings = header.detail_rings.load(Ordering::Relaxed);
        if capacity == 0
            || capacity > MAX_THREADS
            || !(MIN_RINGS_PER_LANE..=MAX_RINGS_PER_LANE).contains(&(index_rings as usize))
            || !(MIN_RINGS_PER_LANE..=MAX_RINGS_PER_LANE).contains(&(detail_rings as usize))
        {
            return Err(SetupError::LayoutMismatch(format!(
                "capacity {capacity}, index rings {index_rings}, detail rings {detail_rings}"
            )));
        }
        let index_cap = header.index_ring_capacity.load(Ordering::Relaxed);
        let detail_cap = header.detail_ring_capacity.load(Ordering::Relaxed);
        for cap in [index_cap, detail_cap] {
            if cap == 0 || !cap.is_power_of_two() {
                return Err(SetupError::InvalidCapacity(cap));
            }
        }

        let layout = RegistryLayout::from_params(capacity, index_rings, index_cap, detail_rings, detail_cap);
        let stored = [
            ("slots_offset", header.slots_offset.load(Ordering::Relaxed), layout.slots_offset),
            ("slot_stride", header.slot_stride.load(Ordering::Relaxed), layout.slot_stride),
            ("arena_offset", header.arena_offset.load(Ordering::Relaxed), layout.arena_offset),
            ("arena_stride", header.arena_stride.load(Ordering::Relaxed), layout.arena_stride),
            ("segment_size", header.segment_size.load(Ordering::Relaxed), layout.segment_size),
        ];
        for (name, found, expected) in stored {
            if found != expected {
                return Err(SetupError::LayoutMismatch(format!("{name}: stored {found}, expected {expected}")));
            }
        }
        let seg = segment.segment();
        seg.check_range(0, layout.segment_size)?;

        // Every ring descriptor must point inside the segment
        for slot in 0..capacity {
            let set: &ThreadLaneSet = seg.view(layout.slot_offset(slot))?;
            for lane in [&set.index_lane, &set.detail_lane] {
                for desc in lane.descriptors() {
                    seg.check_range(desc.offset(), desc.size_bytes())?;
                }
            }
        }

        Ok(Self { segment, layout })
    }

    fn header(&self) -> &RegistryHeader {
        self.segment.root()
    }

    #[must_use]
    pub fn segment(&self) -> &ShmSegment {
        self.segment.segment()
    }

    #[must_use]
    pub fn layout(&self) -> &RegistryLayout {
        &self.layout
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        SessionId(self.header().session_id.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.layout.capacity
    }

    /// Slots claimed so far (active or inactive)
    #[must_use]
    pub fn registered_count(&self) -> u32 {
        self.header().cursor.load(Ordering::Acquire).min(self.layout.capacity)
    }

    #[must_use]
    pub fn active_count(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let count = self.slots().filter(ThreadSlot::is_active).count() as u32;
        count
    }

    #[must_use]
    pub fn registration_failures(&self) -> u64 {
        self.header().registration_failures.load(Ordering::Relaxed)
    }

    /// Slot `index` once its owner has published it. A slot whose cursor
    /// claim is still being initialized stays invisible.
    #[must_use]
    pub fn slot(&self, index: SlotIndex) -> Option<ThreadSlot<'_>> {
        if index.0 >= self.registered_count() {
            return None;
        }
        let shm: &ThreadLaneSet = self.segment().view(self.layout.slot_offset(index.0)).ok()?;
        let slot = ThreadSlot { shm, segment: self.segment(), index };
        (slot.state() != SlotState::Vacant).then_some(slot)
    }

    /// Every published slot (active or inactive), in slot order
    pub fn slots(&self) -> impl Iterator<Item = ThreadSlot<'_>> {
        (0..self.registered_count()).filter_map(|i| self.slot(SlotIndex(i)))
    }

    /// Active slot owned by `thread_id`
    #[must_use]
    pub fn lookup(&self, thread_id: ThreadId) -> Option<ThreadSlot<'_>> {
        self.slots().find(|slot| slot.is_active() && slot.thread_id() == thread_id)
    }

    /// Claim a slot for `thread_id`.
    ///
    /// A thread that is already registered gets its existing slot back.
    /// Returns `None` when the registry is full or no longer accepting, and
    /// counts the failure; callers then run untraced.
    pub fn register(&self, thread_id: ThreadId) -> Option<ThreadSlot<'_>> {
        if let Some(existing) = self.lookup(thread_id) {
            return Some(existing);
        }
        let header = self.header();
        if header.accepting.load(Ordering::Acquire) == 0 || header.shutdown.load(Ordering::Acquire) != 0 {
            header.registration_failures.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let capacity = self.layout.capacity;
        let claimed =
            header.cursor.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| (c < capacity).then_some(c + 1));
        let Ok(index) = claimed else {
            header.registration_failures.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let Ok(shm) = self.segment().view::<ThreadLaneSet>(self.layout.slot_offset(index)) else {
            header.registration_failures.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        shm.thread_id.store(thread_id.0, Ordering::Relaxed);
        shm.slot_index.store(index, Ordering::Relaxed);
        shm.call_depth.store(0, Ordering::Relaxed);
        shm.next_index_seq.store(0, Ordering::Relaxed);
        shm.next_detail_seq.store(0, Ordering::Relaxed);
        shm.index_lane.reset();
        shm.detail_lane.reset();

        let low = u8::try_from(header.low_watermark_pct.load(Ordering::Relaxed)).unwrap_or(25);
        let high = u8::try_from(header.high_watermark_pct.load(Ordering::Relaxed)).unwrap_or(75);
        let window = header.stability_window_ns.load(Ordering::Relaxed);
        Backpressure::new(&shm.index_pressure).init(Watermarks::for_lane(self.layout.index_rings, low, high), window);
        Backpressure::new(&shm.detail_pressure).init(Watermarks::for_lane(self.layout.detail_rings, low, high), window);
        shm.metrics.reset(u64::from(self.layout.index_rings + self.layout.detail_rings));

        // Publish: everything above is visible to whoever sees Active
        shm.state.store(SlotState::Active.as_raw(), Ordering::Release);
        Some(ThreadSlot { shm, segment: self.segment(), index: SlotIndex(index) })
    }

    /// Mark a slot inactive. Its memory stays reserved for the session.
    pub fn unregister(&self, index: SlotIndex) -> bool {
        let Some(slot) = self.slot(index) else {
            return false;
        };
        slot.shm
            .state
            .compare_exchange(
                SlotState::Active.as_raw(),
                SlotState::Inactive.as_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Stop handing out slots
    pub fn stop_accepting(&self) {
        self.header().accepting.store(0, Ordering::Release);
    }

    pub fn request_shutdown(&self) {
        self.header().shutdown.store(1, Ordering::Release);
    }

    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.header().shutdown.load(Ordering::Acquire) != 0
    }

    /// Collect every offset/size pair stored in the header and lane sets
    #[must_use]
    pub fn dump(&self) -> RegistryDump {
        let header = self.header();
        let mut entries = vec![
            DumpEntry {
                label: "header.slots".to_string(),
                offset: header.slots_offset.load(Ordering::Relaxed),
                size: header.slot_stride.load(Ordering::Relaxed) * u64::from(self.layout.capacity),
            },
            DumpEntry {
                label: "header.arena".to_string(),
                offset: header.arena_offset.load(Ordering::Relaxed),
                size: header.arena_stride.load(Ordering::Relaxed) * u64::from(self.layout.capacity),
            },
        ];
        for slot in 0..self.layout.capacity {
            let Ok(set) = self.segment().view::<ThreadLaneSet>(self.layout.slot_offset(slot)) else {
                continue;
            };
            for (name, lane) in [("index", &set.index_lane), ("detail", &set.detail_lane)] {
                for (ring, desc) in lane.descriptors().enumerate() {
                    entries.push(DumpEntry {
                        label: format!("slot{slot}.{name}.ring{ring}"),
                        offset: desc.offset(),
                        size: desc.size_bytes(),
                    });
                }
            }
        }
        RegistryDump { segment_size: self.segment().len(), entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(max_threads: u32) -> RegistryConfig {
        RegistryConfig {
            max_threads,
            index_rings: 3,
            index_ring_capacity: 16,
            detail_rings: 2,
            detail_ring_capacity: 4,
            global_ring_capacity: 16,
        }
    }

    fn registry(max_threads: u32) -> ThreadRegistry {
        let config = small_config(max_threads);
        let seg = ShmSegment::anonymous("/registry", ThreadRegistry::required_size(&config)).unwrap();
        ThreadRegistry::create(seg, &config, &BackpressureConfig::default(), SessionId(1)).unwrap()
    }

    #[test]
    fn test_register_initializes_lanes() {
        let reg = registry(4);
        let slot = reg.register(ThreadId(100)).unwrap();
        assert_eq!(slot.index(), SlotIndex(0));
        assert_eq!(slot.thread_id(), ThreadId(100));
        assert_eq!(slot.index_lane().free_depth(), 2);
        assert_eq!(slot.detail_lane().free_depth(), 1);
        assert!(slot.index_lane().active_ring().is_some());
        assert_eq!(slot.metrics().snapshot().rings_in_rotation, 5);
    }

    #[test]
    fn test_duplicate_registration_returns_same_slot() {
        let reg = registry(4);
        let a = reg.register(ThreadId(7)).unwrap();
        let b = reg.register(ThreadId(7)).unwrap();
        assert_eq!(a.index(), b.index());
        assert_eq!(reg.active_count(), 1);
        assert_eq!(reg.registered_count(), 1);
    }

    #[test]
    fn test_full_registry_fails_softly() {
        let reg = registry(2);
        assert!(reg.register(ThreadId(1)).is_some());
        assert!(reg.register(ThreadId(2)).is_some());
        assert!(reg.register(ThreadId(3)).is_none());
        assert_eq!(reg.registration_failures(), 1);
        assert_eq!(reg.registered_count(), 2);
    }

    #[test]
    fn test_unregister_never_recycles() {
        let reg = registry(2);
        let slot = reg.register(ThreadId(1)).unwrap().index();
        assert!(reg.unregister(slot));
        assert!(!reg.unregister(slot));
        assert_eq!(reg.active_count(), 0);
        assert!(reg.lookup(ThreadId(1)).is_none());

        // Re-registering the same thread claims a fresh slot
        let again = reg.register(ThreadId(1)).unwrap();
        assert_eq!(again.index(), SlotIndex(1));
        assert!(reg.register(ThreadId(9)).is_none());
    }

    #[test]
    fn test_claimed_but_unpublished_slot_is_invisible() {
        let reg = registry(4);
        // A producer has won the cursor but not yet published Active
        reg.header().cursor.fetch_add(1, Ordering::AcqRel);
        assert_eq!(reg.registered_count(), 1);
        assert!(reg.slot(SlotIndex(0)).is_none());
        assert_eq!(reg.slots().count(), 0);
        assert!(!reg.unregister(SlotIndex(0)));

        let slot = reg.register(ThreadId(8)).unwrap();
        assert_eq!(slot.index(), SlotIndex(1));
        let visible: Vec<SlotIndex> = reg.slots().map(|s| s.index()).collect();
        assert_eq!(visible, vec![SlotIndex(1)]);
        assert_eq!(reg.active_count(), 1);
    }

    #[test]
    fn test_create_rejects_single_ring_lanes() {
        for (index_rings, detail_rings) in [(1, 2), (3, 1), (9, 2)] {
            let config = RegistryConfig { index_rings, detail_rings, ..small_config(2) };
            let seg = ShmSegment::anonymous("/registry", ThreadRegistry::required_size(&config)).unwrap();
            let result = ThreadRegistry::create(seg, &config, &BackpressureConfig::default(), SessionId(1));
            assert!(matches!(result, Err(SetupError::InvalidConfig(_))), "{index_rings}/{detail_rings} accepted");
        }
    }

    #[test]
    fn test_detail_seq_wraps_past_no_detail_marker() {
        let reg = registry(1);
        let slot = reg.register(ThreadId(2)).unwrap();
        slot.shm.next_detail_seq.store(NO_DETAIL_SEQ - 1, Ordering::Relaxed);
        assert_eq!(slot.next_detail_seq(), NO_DETAIL_SEQ - 1);
        assert_eq!(slot.next_detail_seq(), 0);
        assert_eq!(slot.next_detail_seq(), 1);
    }

    #[test]
    fn test_stop_accepting() {
        let reg = registry(4);
        reg.stop_accepting();
        assert!(reg.register(ThreadId(1)).is_none());
    }

    #[test]
    fn test_attach_rejects_garbage() {
        let config = small_config(2);
        let seg = ShmSegment::anonymous("/registry", ThreadRegistry::required_size(&config)).unwrap();
        assert!(matches!(ThreadRegistry::attach(seg), Err(SetupError::BadMagic { .. })));
    }

    #[test]
    fn test_create_rejects_small_segment() {
        let config = small_config(2);
        let seg = ShmSegment::anonymous("/registry", 4096).unwrap();
        let result = ThreadRegistry::create(seg, &config, &BackpressureConfig::default(), SessionId(1));
        assert!(matches!(result, Err(SetupError::RegionTooSmall { .. })));
    }

    #[test]
    fn test_dump_offsets_in_range() {
        let reg = registry(3);
        reg.register(ThreadId(5)).unwrap();
        let dump = reg.dump();
        assert_eq!(dump.entries.len(), 2 + 3 * 5);
        assert!(dump.out_of_range().is_empty());
    }
}
