//! ATF v2 on-disk layout
//!
//! Every multi-byte field is little-endian and encoded field by field, so the
//! file layout does not depend on the host's struct layout.
//!
//! ```text
//! index.atf                              detail.atf
//! ┌──────────────────────┐ 0             ┌──────────────────────┐ 0
//! │ IndexHeader (64)     │               │ DetailHeader (64)    │
//! ├──────────────────────┤ 64            ├──────────────────────┤ 64
//! │ IndexEvent (32) × N  │ ──detail_seq─▶│ [len|hdr(24)|payload]│ × M
//! │                      │ ◀─index_seq── │                      │
//! ├──────────────────────┤ footer_offset ├──────────────────────┤
//! │ IndexFooter (64)     │               │ DetailFooter (64)    │
//! └──────────────────────┘               └──────────────────────┘
//! ```

use crate::domain::TraceFileError;
use ada_tracer_common::IndexEvent;
use serde::Serialize;

pub const INDEX_MAGIC: [u8; 4] = *b"ATI2";
pub const INDEX_FOOTER_MAGIC: [u8; 4] = *b"2ITA";
pub const DETAIL_MAGIC: [u8; 4] = *b"ATD2";
pub const DETAIL_FOOTER_MAGIC: [u8; 4] = *b"2DTA";

pub const ENDIAN_LITTLE: u8 = 0x01;
pub const FORMAT_VERSION: u8 = 1;

pub const HEADER_SIZE: usize = 64;
pub const FOOTER_SIZE: usize = 64;
pub const INDEX_EVENT_SIZE: usize = 32;
pub const DETAIL_EVENT_HEADER_SIZE: usize = 24;

#[allow(clippy::cast_possible_truncation)]
const INDEX_EVENT_SIZE_FIELD: u32 = INDEX_EVENT_SIZE as u32;

/// Index header flag: a detail file accompanies this index
pub const INDEX_FLAG_HAS_DETAIL_FILE: u32 = 1 << 0;

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn magic_of(buf: &[u8]) -> [u8; 4] {
    [buf[0], buf[1], buf[2], buf[3]]
}

fn require_len(buf: &[u8], len: usize, what: &str) -> Result<(), TraceFileError> {
    if buf.len() < len {
        return Err(TraceFileError::Truncated(what.to_string()));
    }
    Ok(())
}

fn check_magic(buf: &[u8], expected: [u8; 4], file: &str) -> Result<(), TraceFileError> {
    let found = magic_of(buf);
    if found != expected {
        return Err(TraceFileError::BadMagic { file: file.to_string(), found });
    }
    Ok(())
}

fn check_preamble(buf: &[u8]) -> Result<(), TraceFileError> {
    if buf[4] != ENDIAN_LITTLE {
        return Err(TraceFileError::UnsupportedEndian(buf[4]));
    }
    if buf[5] != FORMAT_VERSION {
        return Err(TraceFileError::UnsupportedVersion(buf[5]));
    }
    Ok(())
}

/// 64-byte header at the start of `index.atf`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexHeader {
    pub arch: u8,
    pub os: u8,
    pub flags: u32,
    pub thread_id: u32,
    pub clock_type: u8,
    pub event_size: u32,
    pub event_count: u32,
    pub events_offset: u64,
    pub footer_offset: u64,
    pub time_start_ns: u64,
    pub time_end_ns: u64,
}

impl IndexHeader {
    /// Placeholder written before any event; rewritten on finalize
    #[must_use]
    pub fn placeholder(arch: u8, os: u8, thread_id: u32, clock_type: u8) -> Self {
        Self {
            arch,
            os,
            flags: 0,
            thread_id,
            clock_type,
            event_size: INDEX_EVENT_SIZE_FIELD,
            event_count: 0,
            events_offset: HEADER_SIZE as u64,
            footer_offset: HEADER_SIZE as u64,
            time_start_ns: 0,
            time_end_ns: 0,
        }
    }

    #[must_use]
    pub fn has_detail_file(&self) -> bool {
        self.flags & INDEX_FLAG_HAS_DETAIL_FILE != 0
    }

    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..4].copy_from_slice(&INDEX_MAGIC);
        buf[4] = ENDIAN_LITTLE;
        buf[5] = FORMAT_VERSION;
        buf[6] = self.arch;
        buf[7] = self.os;
        put_u32(&mut buf, 8, self.flags);
        put_u32(&mut buf, 12, self.thread_id);
        buf[16] = self.clock_type;
        put_u32(&mut buf, 24, self.event_size);
        put_u32(&mut buf, 28, self.event_count);
        put_u64(&mut buf, 32, self.events_offset);
        put_u64(&mut buf, 40, self.footer_offset);
        put_u64(&mut buf, 48, self.time_start_ns);
        put_u64(&mut buf, 56, self.time_end_ns);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TraceFileError> {
        require_len(buf, HEADER_SIZE, "index header")?;
        check_magic(buf, INDEX_MAGIC, "index.atf")?;
        check_preamble(buf)?;
        Ok(Self {
            arch: buf[6],
            os: buf[7],
            flags: get_u32(buf, 8),
            thread_id: get_u32(buf, 12),
            clock_type: buf[16],
            event_size: get_u32(buf, 24),
            event_count: get_u32(buf, 28),
            events_offset: get_u64(buf, 32),
            footer_offset: get_u64(buf, 40),
            time_start_ns: get_u64(buf, 48),
            time_end_ns: get_u64(buf, 56),
        })
    }
}

/// 64-byte footer closing `index.atf`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexFooter {
    /// CRC32 of the events section
    pub checksum: u32,
    pub event_count: u64,
    pub time_start_ns: u64,
    pub time_end_ns: u64,
    pub bytes_written: u64,
}

impl IndexFooter {
    #[must_use]
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[..4].copy_from_slice(&INDEX_FOOTER_MAGIC);
        put_u32(&mut buf, 4, self.checksum);
        put_u64(&mut buf, 8, self.event_count);
        put_u64(&mut buf, 16, self.time_start_ns);
        put_u64(&mut buf, 24, self.time_end_ns);
        put_u64(&mut buf, 32, self.bytes_written);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TraceFileError> {
        require_len(buf, FOOTER_SIZE, "index footer")?;
        check_magic(buf, INDEX_FOOTER_MAGIC, "index.atf footer")?;
        Ok(Self {
            checksum: get_u32(buf, 4),
            event_count: get_u64(buf, 8),
            time_start_ns: get_u64(buf, 16),
            time_end_ns: get_u64(buf, 24),
            bytes_written: get_u64(buf, 32),
        })
    }
}

/// 64-byte header at the start of `detail.atf`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DetailHeader {
    pub arch: u8,
    pub os: u8,
    pub flags: u32,
    pub thread_id: u32,
    pub events_offset: u64,
    pub event_count: u64,
    pub bytes_length: u64,
    /// Smallest index sequence any detail event links back to
    pub index_seq_start: u64,
    /// Largest index sequence any detail event links back to
    pub index_seq_end: u64,
}

impl DetailHeader {
    #[must_use]
    pub fn placeholder(arch: u8, os: u8, thread_id: u32) -> Self {
        Self {
            arch,
            os,
            flags: 0,
            thread_id,
            events_offset: HEADER_SIZE as u64,
            event_count: 0,
            bytes_length: 0,
            index_seq_start: 0,
            index_seq_end: 0,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..4].copy_from_slice(&DETAIL_MAGIC);
        buf[4] = ENDIAN_LITTLE;
        buf[5] = FORMAT_VERSION;
        buf[6] = self.arch;
        buf[7] = self.os;
        put_u32(&mut buf, 8, self.flags);
        put_u32(&mut buf, 12, self.thread_id);
        put_u64(&mut buf, 20, self.events_offset);
        put_u64(&mut buf, 28, self.event_count);
        put_u64(&mut buf, 36, self.bytes_length);
        put_u64(&mut buf, 44, self.index_seq_start);
        put_u64(&mut buf, 52, self.index_seq_end);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TraceFileError> {
        require_len(buf, HEADER_SIZE, "detail header")?;
        check_magic(buf, DETAIL_MAGIC, "detail.atf")?;
        check_preamble(buf)?;
        Ok(Self {
            arch: buf[6],
            os: buf[7],
            flags: get_u32(buf, 8),
            thread_id: get_u32(buf, 12),
            events_offset: get_u64(buf, 20),
            event_count: get_u64(buf, 28),
            bytes_length: get_u64(buf, 36),
            index_seq_start: get_u64(buf, 44),
            index_seq_end: get_u64(buf, 52),
        })
    }
}

/// 64-byte footer closing `detail.atf`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DetailFooter {
    pub checksum: u32,
    pub event_count: u64,
    pub bytes_length: u64,
    pub time_start_ns: u64,
    pub time_end_ns: u64,
}

impl DetailFooter {
    #[must_use]
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[..4].copy_from_slice(&DETAIL_FOOTER_MAGIC);
        put_u32(&mut buf, 4, self.checksum);
        put_u64(&mut buf, 8, self.event_count);
        put_u64(&mut buf, 16, self.bytes_length);
        put_u64(&mut buf, 24, self.time_start_ns);
        put_u64(&mut buf, 32, self.time_end_ns);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TraceFileError> {
        require_len(buf, FOOTER_SIZE, "detail footer")?;
        check_magic(buf, DETAIL_FOOTER_MAGIC, "detail.atf footer")?;
        Ok(Self {
            checksum: get_u32(buf, 4),
            event_count: get_u64(buf, 8),
            bytes_length: get_u64(buf, 16),
            time_start_ns: get_u64(buf, 24),
            time_end_ns: get_u64(buf, 32),
        })
    }
}

/// 24-byte length-prefixed header of one detail event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DetailEventHeader {
    /// Header plus payload, in bytes
    pub total_length: u32,
    pub event_type: u16,
    pub flags: u16,
    /// Position of the linked event in `index.atf`
    pub index_seq: u32,
    pub thread_id: u32,
    pub timestamp_ns: u64,
}

impl DetailEventHeader {
    #[must_use]
    pub fn payload_len(&self) -> usize {
        (self.total_length as usize).saturating_sub(DETAIL_EVENT_HEADER_SIZE)
    }

    #[must_use]
    pub fn encode(&self) -> [u8; DETAIL_EVENT_HEADER_SIZE] {
        let mut buf = [0u8; DETAIL_EVENT_HEADER_SIZE];
        put_u32(&mut buf, 0, self.total_length);
        put_u16(&mut buf, 4, self.event_type);
        put_u16(&mut buf, 6, self.flags);
        put_u32(&mut buf, 8, self.index_seq);
        put_u32(&mut buf, 12, self.thread_id);
        put_u64(&mut buf, 16, self.timestamp_ns);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TraceFileError> {
        require_len(buf, DETAIL_EVENT_HEADER_SIZE, "detail event header")?;
        Ok(Self {
            total_length: get_u32(buf, 0),
            event_type: get_u16(buf, 4),
            flags: get_u16(buf, 6),
            index_seq: get_u32(buf, 8),
            thread_id: get_u32(buf, 12),
            timestamp_ns: get_u64(buf, 16),
        })
    }
}

#[must_use]
pub fn encode_index_event(event: &IndexEvent) -> [u8; INDEX_EVENT_SIZE] {
    let mut buf = [0u8; INDEX_EVENT_SIZE];
    put_u64(&mut buf, 0, event.timestamp_ns);
    put_u64(&mut buf, 8, event.function_id);
    put_u32(&mut buf, 16, event.thread_id);
    put_u32(&mut buf, 20, event.event_kind);
    put_u32(&mut buf, 24, event.call_depth);
    put_u32(&mut buf, 28, event.detail_seq);
    buf
}

pub fn decode_index_event(buf: &[u8]) -> Result<IndexEvent, TraceFileError> {
    require_len(buf, INDEX_EVENT_SIZE, "index event")?;
    Ok(IndexEvent {
        timestamp_ns: get_u64(buf, 0),
        function_id: get_u64(buf, 8),
        thread_id: get_u32(buf, 16),
        event_kind: get_u32(buf, 20),
        call_depth: get_u32(buf, 24),
        detail_seq: get_u32(buf, 28),
    })
}
