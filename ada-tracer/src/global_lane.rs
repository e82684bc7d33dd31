//! Shared fallback lane
//!
//! One ring for every producer, used while the drain is not yet trusted
//! (`GlobalOnly`) and as a mirror during `DualWrite`. Producers serialize on a
//! try-lock word: a producer that loses the race does not wait, its record is
//! simply not admitted and counted as contended. The ring stays SPSC from its
//! own point of view because only the lock holder produces.

use crate::domain::SetupError;
use crate::ring::{ring_bytes, RingBuffer};
use crate::shm::{align_up, RootedSegment, SharedLayout, ShmSegment, LAYOUT_ALIGN};
use ada_tracer_common::GlobalRecord;
use serde::Serialize;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// "ADGL"
pub const GLOBAL_MAGIC: u32 = 0x4144_474C;
pub const GLOBAL_VERSION: u32 = 1;

#[allow(clippy::cast_possible_truncation)]
const GLOBAL_ELEMENT: u32 = size_of::<GlobalRecord>() as u32;

const RING_OFFSET: u64 = align_up(size_of::<GlobalLaneHeader>() as u64, LAYOUT_ALIGN);

#[repr(C)]
pub struct GlobalLaneHeader {
    magic: AtomicU32,
    version: AtomicU32,
    lock: AtomicU32,
    capacity: AtomicU32,
    admitted: AtomicU64,
    contended: AtomicU64,
    rejected_full: AtomicU64,
}

// SAFETY: repr(C), atomics only, zero is an unpublished header
unsafe impl SharedLayout for GlobalLaneHeader {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GlobalLaneStats {
    pub admitted: u64,
    pub contended: u64,
    pub rejected_full: u64,
}

pub struct GlobalLane {
    segment: RootedSegment<GlobalLaneHeader>,
}

impl std::fmt::Debug for GlobalLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalLane").field("segment", self.segment.segment()).finish()
    }
}

impl GlobalLane {
    #[must_use]
    pub fn required_size(capacity: u32) -> u64 {
        RING_OFFSET + ring_bytes(capacity, GLOBAL_ELEMENT)
    }

    pub fn create(segment: ShmSegment, capacity: u32) -> Result<Self, SetupError> {
        let needed = Self::required_size(capacity);
        if segment.len() < needed {
            return Err(SetupError::RegionTooSmall { needed, available: segment.len() });
        }
        let segment = RootedSegment::<GlobalLaneHeader>::new(segment)?;
        RingBuffer::create(
            segment.segment().region(RING_OFFSET, ring_bytes(capacity, GLOBAL_ELEMENT))?,
            capacity,
            GLOBAL_ELEMENT,
        )?;
        let header = segment.root();
        header.version.store(GLOBAL_VERSION, Ordering::Relaxed);
        header.capacity.store(capacity, Ordering::Relaxed);
        header.lock.store(0, Ordering::Relaxed);
        header.magic.store(GLOBAL_MAGIC, Ordering::Release);
        Ok(Self { segment })
    }

    pub fn attach(segment: ShmSegment) -> Result<Self, SetupError> {
        let segment = RootedSegment::<GlobalLaneHeader>::new(segment)?;
        let header = segment.root();
        let magic = header.magic.load(Ordering::Acquire);
        if magic != GLOBAL_MAGIC {
            return Err(SetupError::BadMagic { what: "global lane", expected: GLOBAL_MAGIC, found: magic });
        }
        let version = header.version.load(Ordering::Relaxed);
        if version != GLOBAL_VERSION {
            return Err(SetupError::VersionMismatch { what: "global lane", expected: GLOBAL_VERSION, found: version });
        }
        let lane = Self { segment };
        lane.ring()?;
        Ok(lane)
    }

    #[must_use]
    pub fn segment(&self) -> &ShmSegment {
        self.segment.segment()
    }

    fn ring(&self) -> Result<RingBuffer<'_>, SetupError> {
        let capacity = self.segment.root().capacity.load(Ordering::Relaxed);
        let region = self.segment().region(RING_OFFSET, ring_bytes(capacity, GLOBAL_ELEMENT))?;
        RingBuffer::attach(region, GLOBAL_ELEMENT)
    }

    /// Producer: append if the lock is free and the ring has room
    pub fn try_write(&self, record: &GlobalRecord) -> bool {
        let header = self.segment.root();
        if header.lock.compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed).is_err() {
            header.contended.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let written = self.ring().is_ok_and(|ring| ring.write_record(record));
        header.lock.store(0, Ordering::Release);

        if written {
            header.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            header.rejected_full.fetch_add(1, Ordering::Relaxed);
        }
        written
    }

    /// Drain: move up to `max` records into `out`
    pub fn drain_into(&self, out: &mut Vec<GlobalRecord>, max: usize) -> usize {
        self.ring().map_or(0, |ring| ring.drain_records(out, max))
    }

    #[must_use]
    pub fn pending(&self) -> u64 {
        self.ring().map_or(0, |ring| ring.available_read())
    }

    #[must_use]
    pub fn stats(&self) -> GlobalLaneStats {
        let header = self.segment.root();
        GlobalLaneStats {
            admitted: header.admitted.load(Ordering::Relaxed),
            contended: header.contended.load(Ordering::Relaxed),
            rejected_full: header.rejected_full.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ada_tracer_common::{IndexEvent, GLOBAL_FLAG_MIRRORED};

    fn lane(capacity: u32) -> GlobalLane {
        let seg = ShmSegment::anonymous("/global", GlobalLane::required_size(capacity)).unwrap();
        GlobalLane::create(seg, capacity).unwrap()
    }

    #[test]
    fn test_write_and_drain() {
        let lane = lane(8);
        let record = GlobalRecord {
            event: IndexEvent { timestamp_ns: 5, ..IndexEvent::default() },
            flags: GLOBAL_FLAG_MIRRORED,
            _padding: [0; 3],
        };
        assert!(lane.try_write(&record));
        assert!(lane.try_write(&GlobalRecord::default()));
        assert_eq!(lane.pending(), 2);

        let mut out = Vec::new();
        assert_eq!(lane.drain_into(&mut out, 16), 2);
        assert!(out[0].is_mirrored());
        assert_eq!(out[0].event.timestamp_ns, 5);
        assert!(!out[1].is_mirrored());
        assert_eq!(lane.stats().admitted, 2);
    }

    #[test]
    fn test_held_lock_rejects_without_waiting() {
        let lane = lane(8);
        lane.segment.root().lock.store(1, Ordering::Relaxed);
        assert!(!lane.try_write(&GlobalRecord::default()));
        assert_eq!(lane.stats().contended, 1);
    }

    #[test]
    fn test_full_ring_is_counted() {
        let lane = lane(2);
        assert!(lane.try_write(&GlobalRecord::default()));
        assert!(lane.try_write(&GlobalRecord::default()));
        assert!(!lane.try_write(&GlobalRecord::default()));
        assert_eq!(lane.stats().rejected_full, 1);
    }

    #[test]
    fn test_attach_requires_magic() {
        let seg = ShmSegment::anonymous("/global", GlobalLane::required_size(4)).unwrap();
        assert!(matches!(GlobalLane::attach(seg), Err(SetupError::BadMagic { .. })));
    }
}
