//! # Lanes and ring-pool swapping
//!
//! A lane owns a small pool of rings. Exactly one ring is *active* (the
//! producer appends to it); the rest are either *submitted* (full, waiting for
//! the drain) or *free* (drained, waiting for reuse). Two SPSC index queues
//! move ring indices between the states:
//!
//! ```text
//!            swap_active_ring()                 take_ring()
//!  producer ───────────────────▶ submit queue ───────────────▶ drain
//!     ▲                                                          │
//!     │      get_free_ring()                  return_ring()      │
//!     └──────────────────────── free queue ◀─────────────────────┘
//! ```
//!
//! The producer only touches the submit tail and the free head; the drain only
//! the opposite ends. Every ring index is in exactly one of the three states.

use crate::ring::RingBuffer;
use crate::shm::{SharedLayout, ShmSegment};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A lane needs a spare ring to swap into
pub const MIN_RINGS_PER_LANE: usize = 2;
/// Maximum rings a lane can hold
pub const MAX_RINGS_PER_LANE: usize = 8;

/// Slots per index queue; larger than the ring count so a push never fails
/// while the ring invariant holds
pub const QUEUE_SLOTS: usize = 16;

/// Location of one ring inside the registry segment
#[repr(C)]
pub struct RingDescriptor {
    offset: AtomicU64,
    size_bytes: AtomicU64,
}

impl RingDescriptor {
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, offset: u64, size_bytes: u64) {
        self.size_bytes.store(size_bytes, Ordering::Relaxed);
        self.offset.store(offset, Ordering::Release);
    }
}

/// Wait-free SPSC queue of ring indices
#[repr(C)]
pub struct IndexQueue {
    head: CachePadded<AtomicU32>,
    tail: CachePadded<AtomicU32>,
    slots: [AtomicU32; QUEUE_SLOTS],
}

#[allow(clippy::cast_possible_truncation)]
const QUEUE_MASK: u32 = (QUEUE_SLOTS - 1) as u32;

impl IndexQueue {
    fn push(&self, value: u32) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) as usize >= QUEUE_SLOTS {
            return false;
        }
        self.slots[(tail & QUEUE_MASK) as usize].store(value, Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    fn pop(&self) -> Option<u32> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let value = self.slots[(head & QUEUE_MASK) as usize].load(Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    fn depth(&self) -> u32 {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    fn clear(&self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
    }
}

/// Shared-memory state of one lane
#[repr(C)]
pub struct LaneShm {
    ring_count: AtomicU32,
    element_size: AtomicU32,
    active_idx: AtomicU32,
    _reserved: AtomicU32,
    rings: [RingDescriptor; MAX_RINGS_PER_LANE],
    submit: IndexQueue,
    free: IndexQueue,
    ring_swaps: AtomicU64,
    pool_exhaustions: AtomicU64,
}

// SAFETY: repr(C), atomics only, zero is an empty lane
unsafe impl SharedLayout for LaneShm {}

impl LaneShm {
    /// Record ring descriptors. Registry creation only.
    pub(crate) fn configure(&self, element_size: u32, rings: &[(u64, u64)]) {
        #[allow(clippy::cast_possible_truncation)]
        let count = rings.len().min(MAX_RINGS_PER_LANE) as u32;
        for (desc, &(offset, size)) in self.rings.iter().zip(rings) {
            desc.set(offset, size);
        }
        self.element_size.store(element_size, Ordering::Relaxed);
        self.ring_count.store(count, Ordering::Release);
    }

    /// Put the lane in its initial state: ring 0 active, the rest free.
    ///
    /// Called by the registering thread before the slot is published.
    pub(crate) fn reset(&self) {
        self.submit.clear();
        self.free.clear();
        self.active_idx.store(0, Ordering::Relaxed);
        for idx in 1..self.ring_count.load(Ordering::Acquire) {
            self.free.push(idx);
        }
        self.ring_swaps.store(0, Ordering::Relaxed);
        self.pool_exhaustions.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn ring_count(&self) -> u32 {
        self.ring_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn element_size(&self) -> u32 {
        self.element_size.load(Ordering::Acquire)
    }

    /// Descriptors actually in use
    pub fn descriptors(&self) -> impl Iterator<Item = &RingDescriptor> {
        self.rings.iter().take(self.ring_count() as usize)
    }
}

/// Per-process handle binding a lane to the segment its offsets refer to
#[derive(Clone, Copy)]
pub struct Lane<'a> {
    shm: &'a LaneShm,
    segment: &'a ShmSegment,
}

impl<'a> Lane<'a> {
    #[must_use]
    pub fn new(shm: &'a LaneShm, segment: &'a ShmSegment) -> Self {
        Self { shm, segment }
    }

    /// Materialize ring `idx` from its stored offset.
    ///
    /// Returns `None` if the index or the descriptor does not check out;
    /// callers on the hot path treat that like a full ring.
    #[must_use]
    pub fn ring(&self, idx: u32) -> Option<RingBuffer<'a>> {
        if idx >= self.shm.ring_count() {
            return None;
        }
        let desc = self.shm.rings.get(idx as usize)?;
        let region = self.segment.region(desc.offset(), desc.size_bytes()).ok()?;
        RingBuffer::attach(region, self.shm.element_size()).ok()
    }

    #[must_use]
    pub fn active_index(&self) -> u32 {
        self.shm.active_idx.load(Ordering::Acquire)
    }

    /// Ring the producer is currently appending to
    #[must_use]
    pub fn active_ring(&self) -> Option<RingBuffer<'a>> {
        self.ring(self.active_index())
    }

    /// Producer: hand a full ring to the drain
    pub fn submit_ring(&self, idx: u32) -> bool {
        self.shm.submit.push(idx)
    }

    /// Drain: next submitted ring, oldest first
    #[must_use]
    pub fn take_ring(&self) -> Option<u32> {
        self.shm.submit.pop()
    }

    /// Drain: give a drained ring back to the producer
    pub fn return_ring(&self, idx: u32) -> bool {
        self.shm.free.push(idx)
    }

    /// Producer: claim a free ring
    #[must_use]
    pub fn get_free_ring(&self) -> Option<u32> {
        self.shm.free.pop()
    }

    /// Producer: replace the active ring with a free one and submit the old
    /// one. Returns the new active index, or `None` when the pool is exhausted.
    pub fn swap_active_ring(&self) -> Option<u32> {
        // Submit depth only shrinks behind the producer's back, so checking
        // first guarantees the push below succeeds
        if self.shm.submit.depth() as usize >= QUEUE_SLOTS {
            return None;
        }
        let Some(fresh) = self.get_free_ring() else {
            self.shm.pool_exhaustions.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let old = self.shm.active_idx.swap(fresh, Ordering::AcqRel);
        self.submit_ring(old);
        self.shm.ring_swaps.fetch_add(1, Ordering::Relaxed);
        Some(fresh)
    }

    /// Rings waiting for the drain
    #[must_use]
    pub fn submitted_depth(&self) -> u32 {
        self.shm.submit.depth()
    }

    /// Rings available to the producer
    #[must_use]
    pub fn free_depth(&self) -> u32 {
        self.shm.free.depth()
    }

    #[must_use]
    pub fn ring_count(&self) -> u32 {
        self.shm.ring_count()
    }

    #[must_use]
    pub fn ring_swaps(&self) -> u64 {
        self.shm.ring_swaps.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn pool_exhaustions(&self) -> u64 {
        self.shm.pool_exhaustions.load(Ordering::Relaxed)
    }
}
