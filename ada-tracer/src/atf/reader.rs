//! Trace reader with crash recovery
//!
//! A file is *clean* when it ends in a footer whose position matches the
//! header's `footer_offset`; its CRC is then verified. Anything else (no
//! footer, torn tail, placeholder header) is read by walking events from the
//! start of the events section until the bytes stop making sense.

use super::format::{
    decode_index_event, DetailEventHeader, DetailFooter, DetailHeader, IndexFooter, IndexHeader,
    DETAIL_EVENT_HEADER_SIZE, DETAIL_FOOTER_MAGIC, FOOTER_SIZE, HEADER_SIZE, INDEX_EVENT_SIZE, INDEX_FOOTER_MAGIC,
};
use super::writer::{DETAIL_FILE_NAME, INDEX_FILE_NAME};
use crate::domain::TraceFileError;
use ada_tracer_common::{
    IndexEvent, DETAIL_EVENT_FUNCTION_CALL, DETAIL_EVENT_FUNCTION_RETURN, EVENT_KIND_CALL, EVENT_KIND_EXCEPTION,
    NO_DETAIL_SEQ,
};
use log::warn;
use serde::Serialize;
use std::path::Path;

/// How a file's contents were obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    /// Footer present and checksum verified
    Clean,
    /// No usable footer; events recovered by sequential scan
    Recovered,
}

/// One event read back from `detail.atf`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetailEvent {
    pub header: DetailEventHeader,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetailTrace {
    pub header: DetailHeader,
    pub footer: Option<DetailFooter>,
    pub status: RecoveryStatus,
    #[serde(skip)]
    pub events: Vec<DetailEvent>,
}

/// Outcome of checking links in both directions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    pub linked: u64,
    pub unlinked: u64,
    /// Index positions whose forward link does not come back to them
    pub broken_forward: Vec<u32>,
    /// Detail positions whose backward link does not come back to them
    pub broken_backward: Vec<u32>,
}

impl LinkReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.broken_forward.is_empty() && self.broken_backward.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceReader {
    pub header: IndexHeader,
    pub footer: Option<IndexFooter>,
    pub status: RecoveryStatus,
    #[serde(skip)]
    pub events: Vec<IndexEvent>,
    pub detail: Option<DetailTrace>,
}

/// Whether `bytes` ends in a footer at the place the header says it is
fn has_clean_footer(bytes: &[u8], magic: [u8; 4], footer_offset: Option<u64>) -> bool {
    if bytes.len() < HEADER_SIZE + FOOTER_SIZE {
        return false;
    }
    let at = bytes.len() - FOOTER_SIZE;
    bytes[at..at + 4] == magic && footer_offset.map_or(true, |offset| offset == at as u64)
}

fn looks_like_index_event(event: &IndexEvent) -> bool {
    (EVENT_KIND_CALL..=EVENT_KIND_EXCEPTION).contains(&event.event_kind)
}

fn scan_index(bytes: &[u8]) -> Vec<IndexEvent> {
    let mut events = Vec::new();
    let mut at = HEADER_SIZE;
    while at + INDEX_EVENT_SIZE <= bytes.len() {
        let rest = &bytes[at..];
        // A torn footer at the tail is not an event
        if rest.len() <= FOOTER_SIZE && rest[..4] == INDEX_FOOTER_MAGIC {
            break;
        }
        let Ok(event) = decode_index_event(rest) else {
            break;
        };
        if !looks_like_index_event(&event) {
            break;
        }
        events.push(event);
        at += INDEX_EVENT_SIZE;
    }
    events
}

/// Walk length-prefixed detail events in `bytes[HEADER_SIZE..end]`
fn scan_detail(bytes: &[u8], end: usize) -> Vec<DetailEvent> {
    let mut events = Vec::new();
    let mut at = HEADER_SIZE;
    while at + DETAIL_EVENT_HEADER_SIZE <= end {
        let Ok(header) = DetailEventHeader::decode(&bytes[at..end]) else {
            break;
        };
        let total = header.total_length as usize;
        let known_type = matches!(header.event_type, DETAIL_EVENT_FUNCTION_CALL | DETAIL_EVENT_FUNCTION_RETURN);
        if total < DETAIL_EVENT_HEADER_SIZE || at + total > end || !known_type {
            break;
        }
        events.push(DetailEvent { header, payload: bytes[at + DETAIL_EVENT_HEADER_SIZE..at + total].to_vec() });
        at += total;
    }
    events
}

fn read_detail(path: &Path) -> Result<DetailTrace, TraceFileError> {
    let bytes = std::fs::read(path)?;
    let header = DetailHeader::decode(&bytes)?;

    if has_clean_footer(&bytes, DETAIL_FOOTER_MAGIC, None) {
        let footer_at = bytes.len() - FOOTER_SIZE;
        let footer = DetailFooter::decode(&bytes[footer_at..])?;
        let section = &bytes[HEADER_SIZE..footer_at];
        if footer.bytes_length == section.len() as u64 {
            let actual = crc32fast::hash(section);
            if actual != footer.checksum {
                return Err(TraceFileError::ChecksumMismatch {
                    file: DETAIL_FILE_NAME.to_string(),
                    expected: footer.checksum,
                    actual,
                });
            }
            let events = scan_detail(&bytes, footer_at);
            return Ok(DetailTrace { header, footer: Some(footer), status: RecoveryStatus::Clean, events });
        }
    }

    let events = scan_detail(&bytes, bytes.len());
    warn!("{} has no usable footer, recovered {} events by scan", path.display(), events.len());
    Ok(DetailTrace { header, footer: None, status: RecoveryStatus::Recovered, events })
}

impl TraceReader {
    /// Read `index.atf` and, if present, `detail.atf` from `dir`
    pub fn open(dir: &Path) -> Result<Self, TraceFileError> {
        let index_path = dir.join(INDEX_FILE_NAME);
        let bytes = std::fs::read(&index_path)?;
        let header = IndexHeader::decode(&bytes)?;

        let (footer, status, events) = if has_clean_footer(&bytes, INDEX_FOOTER_MAGIC, Some(header.footer_offset)) {
            let footer_at = bytes.len() - FOOTER_SIZE;
            let footer = IndexFooter::decode(&bytes[footer_at..])?;
            let section = &bytes[HEADER_SIZE..footer_at];
            let actual = crc32fast::hash(section);
            if actual != footer.checksum {
                return Err(TraceFileError::ChecksumMismatch {
                    file: INDEX_FILE_NAME.to_string(),
                    expected: footer.checksum,
                    actual,
                });
            }
            let events = section.chunks_exact(INDEX_EVENT_SIZE).map(decode_index_event).collect::<Result<Vec<_>, _>>()?;
            (Some(footer), RecoveryStatus::Clean, events)
        } else {
            let events = scan_index(&bytes);
            warn!("{} has no usable footer, recovered {} events by scan", index_path.display(), events.len());
            (None, RecoveryStatus::Recovered, events)
        };

        let detail_path = dir.join(DETAIL_FILE_NAME);
        let detail = if detail_path.exists() { Some(read_detail(&detail_path)?) } else { None };

        Ok(Self { header, footer, status, events, detail })
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.status == RecoveryStatus::Clean
            && self.detail.as_ref().map_or(true, |detail| detail.status == RecoveryStatus::Clean)
    }

    #[must_use]
    pub fn detail_events(&self) -> &[DetailEvent] {
        self.detail.as_ref().map_or(&[], |detail| detail.events.as_slice())
    }

    /// Check every forward link resolves to a detail event pointing back, and
    /// every detail event points at an index event linking to it
    #[must_use]
    pub fn verify_links(&self) -> LinkReport {
        let details = self.detail_events();
        let mut report = LinkReport::default();

        for (pos, event) in self.events.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let pos = pos as u32;
            if event.detail_seq == NO_DETAIL_SEQ {
                report.unlinked += 1;
                continue;
            }
            match details.get(event.detail_seq as usize) {
                Some(detail) if detail.header.index_seq == pos => report.linked += 1,
                _ => report.broken_forward.push(pos),
            }
        }

        for (pos, detail) in details.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let pos = pos as u32;
            let back = self.events.get(detail.header.index_seq as usize);
            if back.map_or(true, |event| event.detail_seq != pos) {
                report.broken_backward.push(pos);
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atf::TraceWriter;
    use ada_tracer_common::{DetailRecord, EVENT_KIND_RETURN};

    fn event(ts: u64, kind: u32) -> IndexEvent {
        IndexEvent { timestamp_ns: ts, function_id: 7, thread_id: 1, event_kind: kind, call_depth: 0, detail_seq: 0 }
    }

    fn write_sample(dir: &Path) {
        let mut writer = TraceWriter::create(dir, 0).unwrap();
        for ts in 0..10 {
            let e = event(ts, if ts % 2 == 0 { EVENT_KIND_CALL } else { EVENT_KIND_RETURN });
            if ts % 3 == 0 {
                writer.write_linked(&e, &DetailRecord::new(&e, 0, 0, &[ts as u8; 16])).unwrap();
            } else {
                writer.write_unlinked(&e).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_clean_read_verifies_links() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path());
        let reader = TraceReader::open(dir.path()).unwrap();
        assert!(reader.is_clean());
        assert_eq!(reader.events.len(), 10);
        assert_eq!(reader.detail_events().len(), 4);
        let report = reader.verify_links();
        assert!(report.is_consistent());
        assert_eq!((report.linked, report.unlinked), (4, 6));
    }

    #[test]
    fn test_missing_footer_recovers_by_scan() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path());
        for name in [INDEX_FILE_NAME, DETAIL_FILE_NAME] {
            let path = dir.path().join(name);
            let bytes = std::fs::read(&path).unwrap();
            std::fs::write(&path, &bytes[..bytes.len() - FOOTER_SIZE]).unwrap();
        }
        let reader = TraceReader::open(dir.path()).unwrap();
        assert_eq!(reader.status, RecoveryStatus::Recovered);
        assert!(!reader.is_clean());
        assert_eq!(reader.events.len(), 10);
        assert_eq!(reader.detail_events().len(), 4);
        assert!(reader.verify_links().is_consistent());
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path());
        let path = dir.path().join(INDEX_FILE_NAME);
        let bytes = std::fs::read(&path).unwrap();
        // Half a footer left behind
        std::fs::write(&path, &bytes[..bytes.len() - FOOTER_SIZE / 2]).unwrap();
        let reader = TraceReader::open(dir.path()).unwrap();
        assert_eq!(reader.status, RecoveryStatus::Recovered);
        assert_eq!(reader.events.len(), 10);
    }

    #[test]
    fn test_corrupted_event_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path());
        let path = dir.path().join(INDEX_FILE_NAME);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE + 8] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(TraceReader::open(dir.path()), Err(TraceFileError::ChecksumMismatch { .. })));
    }
}
