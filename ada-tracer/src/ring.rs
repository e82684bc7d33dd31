//! # Lock-free SPSC ring in shared memory
//!
//! Fixed-capacity, power-of-two ring of fixed-size elements. The header and
//! the slot array live in a shared segment; a [`RingBuffer`] is a cheap,
//! per-process handle resolved from a bounds-checked region.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────── RingHeader ───────────────────────────┐
//! │ magic │ version │ capacity │ element_size │ overflow │ ...pad...  │
//! │ write_index (own cache line)                                      │
//! │ read_index  (own cache line)                                      │
//! └───────────────────────────────────────────────────────────────────┘
//! ┌────────┬────────┬────────┬─────   ───┬────────┐
//! │ slot 0 │ slot 1 │ slot 2 │   ...     │ slot N-1│   N = capacity
//! └────────┴────────┴────────┴─────   ───┴────────┘
//! ```
//!
//! ## Ordering contract
//!
//! Indices grow monotonically and are masked with `capacity - 1` on access.
//! The producer copies the element, then publishes `write_index` with
//! `Release`; the consumer loads it with `Acquire` before copying out. The
//! same pairing on `read_index` hands the slot back to the producer. This
//! pairing is the only thing keeping the consumer from reading a half-written
//! slot.

#![allow(unsafe_code)]

use crate::domain::SetupError;
use crate::shm::{align_up, SharedLayout, ShmRegion, LAYOUT_ALIGN};
use ada_tracer_common::{bytes_of, Pod};
use crossbeam_utils::CachePadded;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// "ADRB"
pub const RING_MAGIC: u32 = 0x4144_5242;
pub const RING_VERSION: u32 = 1;

/// Ring header stored at the start of every ring region
#[repr(C)]
pub struct RingHeader {
    magic: AtomicU32,
    version: AtomicU32,
    capacity: AtomicU32,
    element_size: AtomicU32,
    overflow: AtomicU64,
    write_index: CachePadded<AtomicU64>,
    read_index: CachePadded<AtomicU64>,
}

// SAFETY: repr(C), atomics only, all-zero is a valid (unpublished) header
unsafe impl SharedLayout for RingHeader {}

/// Bytes reserved for the header before the slot array
#[allow(clippy::cast_possible_truncation)]
pub const RING_HEADER_SIZE: u64 = align_up(size_of::<RingHeader>() as u64, LAYOUT_ALIGN);

/// Total region size for a ring of `capacity` elements of `element_size` bytes
#[must_use]
pub const fn ring_bytes(capacity: u32, element_size: u32) -> u64 {
    align_up(RING_HEADER_SIZE + capacity as u64 * element_size as u64, LAYOUT_ALIGN)
}

/// Handle onto a ring living in a mapped segment
pub struct RingBuffer<'a> {
    header: &'a RingHeader,
    data: *mut u8,
    capacity: u64,
    mask: u64,
    element_size: usize,
    _region: PhantomData<ShmRegion<'a>>,
}

impl std::fmt::Debug for RingBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("element_size", &self.element_size)
            .field("write_index", &self.write_index())
            .field("read_index", &self.read_index())
            .field("overflow", &self.overflow_count())
            .finish_non_exhaustive()
    }
}

impl<'a> RingBuffer<'a> {
    /// Initialize a new ring in `region`.
    ///
    /// Fails unless `capacity` is a non-zero power of two and the region can
    /// hold the header plus `capacity * element_size` bytes.
    pub fn create(region: ShmRegion<'a>, capacity: u32, element_size: u32) -> Result<Self, SetupError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(SetupError::InvalidCapacity(capacity));
        }
        if element_size == 0 {
            return Err(SetupError::InvalidConfig("ring element size must be non-zero".to_string()));
        }
        let needed = ring_bytes(capacity, element_size);
        if region.len() < needed {
            return Err(SetupError::RegionTooSmall { needed, available: region.len() });
        }

        let header: &RingHeader = region.view(0)?;
        header.version.store(RING_VERSION, Ordering::Relaxed);
        header.capacity.store(capacity, Ordering::Relaxed);
        header.element_size.store(element_size, Ordering::Relaxed);
        header.overflow.store(0, Ordering::Relaxed);
        header.write_index.store(0, Ordering::Relaxed);
        header.read_index.store(0, Ordering::Relaxed);
        // Magic last: a peer that sees it also sees the fields above
        header.magic.store(RING_MAGIC, Ordering::Release);

        Ok(Self::from_parts(header, region, capacity, element_size))
    }

    /// Attach to a ring another process (or an earlier call) created.
    ///
    /// Validates magic, version, capacity, element size and region length;
    /// returns no handle on any mismatch.
    pub fn attach(region: ShmRegion<'a>, element_size: u32) -> Result<Self, SetupError> {
        let header: &RingHeader = region.view(0)?;
        let magic = header.magic.load(Ordering::Acquire);
        if magic != RING_MAGIC {
            return Err(SetupError::BadMagic { what: "ring header", expected: RING_MAGIC, found: magic });
        }
        let version = header.version.load(Ordering::Relaxed);
        if version != RING_VERSION {
            return Err(SetupError::VersionMismatch { what: "ring", expected: RING_VERSION, found: version });
        }
        let capacity = header.capacity.load(Ordering::Relaxed);
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(SetupError::InvalidCapacity(capacity));
        }
        let found = header.element_size.load(Ordering::Relaxed);
        if found != element_size {
            return Err(SetupError::ElementSizeMismatch { expected: element_size, found });
        }
        let needed = ring_bytes(capacity, element_size);
        if region.len() < needed {
            return Err(SetupError::RegionTooSmall { needed, available: region.len() });
        }
        Ok(Self::from_parts(header, region, capacity, element_size))
    }

    fn from_parts(header: &'a RingHeader, region: ShmRegion<'a>, capacity: u32, element_size: u32) -> Self {
        // SAFETY: region length was checked to cover header + slots
        let data = unsafe { region.as_ptr().add(RING_HEADER_SIZE as usize) };
        Self {
            header,
            data,
            capacity: u64::from(capacity),
            mask: u64::from(capacity) - 1,
            element_size: element_size as usize,
            _region: PhantomData,
        }
    }

    #[inline]
    fn slot_ptr(&self, index: u64) -> *mut u8 {
        #[allow(clippy::cast_possible_truncation)]
        let slot = (index & self.mask) as usize;
        // SAFETY: slot < capacity, so the slot lies inside the checked region
        unsafe { self.data.add(slot * self.element_size) }
    }

    /// Producer: append one element. Returns false (and counts an overflow)
    /// when full or when `bytes` is not exactly one element.
    pub fn write(&self, bytes: &[u8]) -> bool {
        if bytes.len() != self.element_size {
            return false;
        }
        let write = self.header.write_index.load(Ordering::Relaxed);
        let read = self.header.read_index.load(Ordering::Acquire);
        if write.wrapping_sub(read) >= self.capacity {
            self.header.overflow.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        // SAFETY: the slot at `write` is not visible to the consumer until the
        // release store below
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.slot_ptr(write), self.element_size) };
        self.header.write_index.store(write.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer: pop one element into `out`. Returns false when empty or when
    /// `out` is shorter than one element.
    pub fn read(&self, out: &mut [u8]) -> bool {
        if out.len() < self.element_size {
            return false;
        }
        let read = self.header.read_index.load(Ordering::Relaxed);
        let write = self.header.write_index.load(Ordering::Acquire);
        if read == write {
            return false;
        }
        // SAFETY: acquire load above makes the producer's copy visible
        unsafe { ptr::copy_nonoverlapping(self.slot_ptr(read), out.as_mut_ptr(), self.element_size) };
        self.header.read_index.store(read.wrapping_add(1), Ordering::Release);
        true
    }

    /// Producer: append a typed record
    pub fn write_record<T: Pod>(&self, record: &T) -> bool {
        self.write(bytes_of(record))
    }

    /// Consumer: pop a typed record
    pub fn read_record<T: Pod>(&self) -> Option<T> {
        if size_of::<T>() != self.element_size {
            return None;
        }
        let read = self.header.read_index.load(Ordering::Relaxed);
        let write = self.header.write_index.load(Ordering::Acquire);
        if read == write {
            return None;
        }
        // SAFETY: slot published by the producer; T is Pod and sized to one element
        let value = unsafe { ptr::read_unaligned(self.slot_ptr(read).cast::<T>()) };
        self.header.read_index.store(read.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Producer: append as many whole elements of `bytes` as fit, publishing
    /// once. Elements that do not fit are counted as overflow.
    pub fn write_batch(&self, bytes: &[u8]) -> usize {
        let requested = bytes.len() / self.element_size;
        if requested == 0 {
            return 0;
        }
        let write = self.header.write_index.load(Ordering::Relaxed);
        let read = self.header.read_index.load(Ordering::Acquire);
        let free = self.capacity - write.wrapping_sub(read);
        #[allow(clippy::cast_possible_truncation)]
        let n = requested.min(free as usize);
        for i in 0..n {
            let src = &bytes[i * self.element_size..(i + 1) * self.element_size];
            // SAFETY: slots write..write+n are free (checked against read)
            unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.slot_ptr(write + i as u64), self.element_size) };
        }
        if n < requested {
            self.header.overflow.fetch_add((requested - n) as u64, Ordering::Relaxed);
        }
        if n > 0 {
            self.header.write_index.store(write.wrapping_add(n as u64), Ordering::Release);
        }
        n
    }

    /// Consumer: pop up to `out.len() / element_size` elements, releasing once
    pub fn read_batch(&self, out: &mut [u8]) -> usize {
        let wanted = out.len() / self.element_size;
        let read = self.header.read_index.load(Ordering::Relaxed);
        let write = self.header.write_index.load(Ordering::Acquire);
        #[allow(clippy::cast_possible_truncation)]
        let n = wanted.min(write.wrapping_sub(read) as usize);
        for i in 0..n {
            let dst = &mut out[i * self.element_size..(i + 1) * self.element_size];
            // SAFETY: slots read..read+n were published by the producer
            unsafe { ptr::copy_nonoverlapping(self.slot_ptr(read + i as u64), dst.as_mut_ptr(), self.element_size) };
        }
        if n > 0 {
            self.header.read_index.store(read.wrapping_add(n as u64), Ordering::Release);
        }
        n
    }

    /// Consumer: pop up to `max` typed records into `out`, releasing once
    pub fn drain_records<T: Pod>(&self, out: &mut Vec<T>, max: usize) -> usize {
        if size_of::<T>() != self.element_size {
            return 0;
        }
        let read = self.header.read_index.load(Ordering::Relaxed);
        let write = self.header.write_index.load(Ordering::Acquire);
        #[allow(clippy::cast_possible_truncation)]
        let n = max.min(write.wrapping_sub(read) as usize);
        out.reserve(n);
        for i in 0..n {
            // SAFETY: published slot, Pod record of exactly one element
            let value = unsafe { ptr::read_unaligned(self.slot_ptr(read + i as u64).cast::<T>()) };
            out.push(value);
        }
        if n > 0 {
            self.header.read_index.store(read.wrapping_add(n as u64), Ordering::Release);
        }
        n
    }

    /// Consumer: drop every readable element, returning how many were dropped
    pub fn discard_all(&self) -> u64 {
        let read = self.header.read_index.load(Ordering::Relaxed);
        let write = self.header.write_index.load(Ordering::Acquire);
        let n = write.wrapping_sub(read);
        if n > 0 {
            self.header.read_index.store(write, Ordering::Release);
        }
        n
    }

    #[must_use]
    pub fn available_read(&self) -> u64 {
        let write = self.header.write_index.load(Ordering::Acquire);
        let read = self.header.read_index.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    #[must_use]
    pub fn available_write(&self) -> u64 {
        self.capacity - self.available_read().min(self.capacity)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.available_read() == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.available_read() >= self.capacity
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    #[must_use]
    pub fn overflow_count(&self) -> u64 {
        self.header.overflow.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn write_index(&self) -> u64 {
        self.header.write_index.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn read_index(&self) -> u64 {
        self.header.read_index.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::ShmSegment;
    use ada_tracer_common::IndexEvent;

    fn segment(capacity: u32, element_size: u32) -> ShmSegment {
        ShmSegment::anonymous("/ring-test", ring_bytes(capacity, element_size)).unwrap()
    }

    #[test]
    fn test_create_rejects_non_power_of_two() {
        let seg = segment(16, 8);
        let region = seg.region(0, seg.len()).unwrap();
        assert!(matches!(RingBuffer::create(region, 12, 8), Err(SetupError::InvalidCapacity(12))));
        assert!(matches!(RingBuffer::create(region, 0, 8), Err(SetupError::InvalidCapacity(0))));
    }

    #[test]
    fn test_full_ring_rejects_and_counts_overflow() {
        let seg = segment(4, 8);
        let ring = RingBuffer::create(seg.region(0, seg.len()).unwrap(), 4, 8).unwrap();
        for i in 0u64..4 {
            assert!(ring.write(&i.to_le_bytes()));
        }
        assert!(ring.is_full());
        assert!(!ring.write(&9u64.to_le_bytes()));
        assert!(!ring.write(&9u64.to_le_bytes()));
        assert_eq!(ring.overflow_count(), 2);

        let mut out = [0u8; 8];
        assert!(ring.read(&mut out));
        assert_eq!(u64::from_le_bytes(out), 0);
        assert_eq!(ring.available_write(), 1);
    }

    #[test]
    fn test_empty_read_returns_false() {
        let seg = segment(8, 4);
        let ring = RingBuffer::create(seg.region(0, seg.len()).unwrap(), 8, 4).unwrap();
        let mut out = [0u8; 4];
        assert!(!ring.read(&mut out));
        assert!(ring.read_record::<IndexEvent>().is_none());
    }

    #[test]
    fn test_wrong_length_write_is_rejected_without_overflow() {
        let seg = segment(8, 4);
        let ring = RingBuffer::create(seg.region(0, seg.len()).unwrap(), 8, 4).unwrap();
        assert!(!ring.write(&[1, 2, 3]));
        assert_eq!(ring.overflow_count(), 0);
    }

    #[test]
    fn test_attach_validates_header() {
        let seg = segment(8, 32);
        let region = seg.region(0, seg.len()).unwrap();
        assert!(matches!(RingBuffer::attach(region, 32), Err(SetupError::BadMagic { .. })));

        RingBuffer::create(region, 8, 32).unwrap();
        assert!(RingBuffer::attach(region, 32).is_ok());
        assert!(matches!(RingBuffer::attach(region, 16), Err(SetupError::ElementSizeMismatch { .. })));

        let short = seg.region(0, RING_HEADER_SIZE + 32).unwrap();
        assert!(matches!(RingBuffer::attach(short, 32), Err(SetupError::RegionTooSmall { .. })));
    }

    #[test]
    fn test_typed_records_wrap_around() {
        let seg = segment(4, 32);
        let ring = RingBuffer::create(seg.region(0, seg.len()).unwrap(), 4, 32).unwrap();
        for round in 0u64..10 {
            let event = IndexEvent { timestamp_ns: round, ..IndexEvent::default() };
            assert!(ring.write_record(&event));
            assert_eq!(ring.read_record::<IndexEvent>().unwrap().timestamp_ns, round);
        }
        assert_eq!(ring.write_index(), 10);
        assert_eq!(ring.read_index(), 10);
    }

    #[test]
    fn test_batch_operations() {
        let seg = segment(8, 4);
        let ring = RingBuffer::create(seg.region(0, seg.len()).unwrap(), 8, 4).unwrap();
        let input: Vec<u8> = (0u32..10).flat_map(u32::to_le_bytes).collect();
        assert_eq!(ring.write_batch(&input), 8);
        assert_eq!(ring.overflow_count(), 2);

        let mut out = vec![0u8; 12];
        assert_eq!(ring.read_batch(&mut out), 3);
        assert_eq!(&out[8..12], &2u32.to_le_bytes());
        assert_eq!(ring.discard_all(), 5);
        assert!(ring.is_empty());
    }
}
