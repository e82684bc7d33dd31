//! # Shared Record Layouts (Producer ↔ Drain)
//!
//! Defines the fixed-size records that travel through the shared-memory rings
//! between traced threads and the drain. All types use `#[repr(C)]` and carry
//! no implicit padding, so both sides see the same bytes regardless of which
//! process maps the segment.
//!
//! ## Key Types
//!
//! - [`IndexEvent`] - 32-byte call/return/exception record, one per occurrence
//! - [`DetailRecord`] - 512-byte slot carrying an optional register/stack payload
//! - [`GlobalRecord`] - index event plus flags, used by the shared fallback lane

#![cfg_attr(not(test), no_std)]

// ============================================================================
// Event Kind Constants
// ============================================================================

/// Function entry
pub const EVENT_KIND_CALL: u32 = 1;

/// Function exit
pub const EVENT_KIND_RETURN: u32 = 2;

/// Exceptional unwind out of a function
pub const EVENT_KIND_EXCEPTION: u32 = 3;

/// Detail event type for a captured call
pub const DETAIL_EVENT_FUNCTION_CALL: u16 = 3;

/// Detail event type for a captured return
pub const DETAIL_EVENT_FUNCTION_RETURN: u16 = 4;

/// Sentinel for "no linked detail event"
pub const NO_DETAIL_SEQ: u32 = u32::MAX;

/// Maximum payload bytes carried by one [`DetailRecord`]
pub const DETAIL_PAYLOAD_CAPACITY: usize = 472;

/// Detail flag: payload was longer than [`DETAIL_PAYLOAD_CAPACITY`] and was cut
pub const DETAIL_FLAG_TRUNCATED: u32 = 1 << 0;

/// Global record flag: record duplicates an event also written to a thread lane
pub const GLOBAL_FLAG_MIRRORED: u32 = 1 << 0;

// ============================================================================
// Ring Records
// ============================================================================

/// Index event as stored in rings and in the index trace file
///
/// **Size**: exactly 32 bytes, no padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexEvent {
    /// Monotonic timestamp in nanoseconds
    pub timestamp_ns: u64,

    /// Opaque function identifier, `(module_id << 32) | symbol_index` by convention
    pub function_id: u64,

    /// OS thread identifier of the producer
    pub thread_id: u32,

    /// One of `EVENT_KIND_*`
    pub event_kind: u32,

    /// Call depth at the time of the event
    pub call_depth: u32,

    /// Forward link to a detail event, or [`NO_DETAIL_SEQ`]
    ///
    /// In rings this holds the producer's detail sequence; in the trace file
    /// it holds the detail event's position in the detail file.
    pub detail_seq: u32,
}

impl IndexEvent {
    /// Returns true if this event links to a detail event
    #[must_use]
    pub fn has_detail(&self) -> bool {
        self.detail_seq != NO_DETAIL_SEQ
    }
}

/// Detail slot as stored in detail rings
///
/// **Size**: exactly 512 bytes. Only `payload[..payload_len]` is meaningful.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DetailRecord {
    pub timestamp_ns: u64,
    pub function_id: u64,
    pub thread_id: u32,
    pub event_kind: u32,

    /// Producer index sequence of the index event this record augments
    pub index_seq: u32,

    /// Producer detail sequence, matched against [`IndexEvent::detail_seq`]
    pub detail_seq: u32,

    pub payload_len: u32,

    /// `DETAIL_FLAG_*` bits
    pub flags: u32,

    pub payload: [u8; DETAIL_PAYLOAD_CAPACITY],
}

impl DetailRecord {
    /// Build a record, truncating `payload` to the slot capacity
    #[must_use]
    pub fn new(event: &IndexEvent, index_seq: u32, detail_seq: u32, payload: &[u8]) -> Self {
        let len = payload.len().min(DETAIL_PAYLOAD_CAPACITY);
        let mut buf = [0u8; DETAIL_PAYLOAD_CAPACITY];
        buf[..len].copy_from_slice(&payload[..len]);
        #[allow(clippy::cast_possible_truncation)]
        let payload_len = len as u32;
        Self {
            timestamp_ns: event.timestamp_ns,
            function_id: event.function_id,
            thread_id: event.thread_id,
            event_kind: event.event_kind,
            index_seq,
            detail_seq,
            payload_len,
            flags: if payload.len() > DETAIL_PAYLOAD_CAPACITY { DETAIL_FLAG_TRUNCATED } else { 0 },
            payload: buf,
        }
    }

    /// Meaningful payload bytes
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        let len = (self.payload_len as usize).min(DETAIL_PAYLOAD_CAPACITY);
        &self.payload[..len]
    }

    /// Detail event type derived from the index event kind
    #[must_use]
    pub fn detail_event_type(&self) -> u16 {
        match self.event_kind {
            EVENT_KIND_RETURN => DETAIL_EVENT_FUNCTION_RETURN,
            _ => DETAIL_EVENT_FUNCTION_CALL,
        }
    }
}

/// Record written to the shared fallback lane
///
/// **Size**: exactly 48 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalRecord {
    pub event: IndexEvent,

    /// `GLOBAL_FLAG_*` bits
    pub flags: u32,

    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u32; 3],
}

impl GlobalRecord {
    #[must_use]
    pub fn is_mirrored(&self) -> bool {
        self.flags & GLOBAL_FLAG_MIRRORED != 0
    }
}

// ============================================================================
// Plain-old-data marker
// ============================================================================

/// Types that may be copied into and out of shared memory as raw bytes.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no padding bytes and accept
/// every bit pattern as a valid value.
#[allow(unsafe_code)]
pub unsafe trait Pod: Copy + 'static {}

// Field layouts above are padding-free and made only of integers
#[allow(unsafe_code)]
unsafe impl Pod for IndexEvent {}

#[allow(unsafe_code)]
unsafe impl Pod for DetailRecord {}

#[allow(unsafe_code)]
unsafe impl Pod for GlobalRecord {}

/// View a record as its raw bytes
#[must_use]
pub fn bytes_of<T: Pod>(value: &T) -> &[u8] {
    // SAFETY: T is Pod, so every byte of the value is initialized
    #[allow(unsafe_code)]
    let bytes = unsafe {
        core::slice::from_raw_parts((value as *const T).cast::<u8>(), core::mem::size_of::<T>())
    };
    bytes
}

/// Read a record from the start of `bytes`, or `None` if too short
#[must_use]
pub fn read_pod<T: Pod>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < core::mem::size_of::<T>() {
        return None;
    }
    // SAFETY: length checked above, T accepts any bit pattern, read is unaligned
    #[allow(unsafe_code)]
    let value = unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) };
    Some(value)
}

const _: () = assert!(core::mem::size_of::<IndexEvent>() == 32);
const _: () = assert!(core::mem::size_of::<DetailRecord>() == 512);
const _: () = assert!(core::mem::size_of::<GlobalRecord>() == 48);
