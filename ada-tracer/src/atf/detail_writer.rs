//! Append-only writer for `detail.atf`
//!
//! Events are length-prefixed (`total_length` covers the 24-byte header and
//! the payload), so a reader can walk the file without an offset table.

use super::format::{DetailEventHeader, DetailFooter, DetailHeader, DETAIL_EVENT_HEADER_SIZE};
use crate::domain::TraceFileError;
use ada_tracer_common::DetailRecord;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct DetailWriter {
    file: BufWriter<File>,
    path: PathBuf,
    header: DetailHeader,
    hasher: crc32fast::Hasher,
    event_count: u32,
    bytes_length: u64,
    index_seq_range: Option<(u32, u32)>,
    time_start_ns: u64,
    time_end_ns: u64,
    finalized: bool,
}

impl std::fmt::Debug for DetailWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetailWriter")
            .field("path", &self.path)
            .field("event_count", &self.event_count)
            .field("bytes_length", &self.bytes_length)
            .finish_non_exhaustive()
    }
}

impl DetailWriter {
    pub fn create(path: &Path, header: DetailHeader) -> Result<Self, TraceFileError> {
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(&header.encode())?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            header,
            hasher: crc32fast::Hasher::new(),
            event_count: 0,
            bytes_length: 0,
            index_seq_range: None,
            time_start_ns: 0,
            time_end_ns: 0,
            finalized: false,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn event_count(&self) -> u32 {
        self.event_count
    }

    /// Append `record` linked back to index position `index_seq`. Returns the
    /// event's position in the detail file.
    pub fn append(&mut self, record: &DetailRecord, index_seq: u32) -> Result<u32, TraceFileError> {
        if self.finalized {
            return Err(TraceFileError::Finalized);
        }
        let payload = record.payload();
        let total = DETAIL_EVENT_HEADER_SIZE + payload.len();
        let total_length = u32::try_from(total).map_err(|_| TraceFileError::DetailTooLarge(total))?;

        #[allow(clippy::cast_possible_truncation)]
        let flags = (record.flags & 0xFFFF) as u16;
        let header = DetailEventHeader {
            total_length,
            event_type: record.detail_event_type(),
            flags,
            index_seq,
            thread_id: record.thread_id,
            timestamp_ns: record.timestamp_ns,
        }
        .encode();
        self.file.write_all(&header)?;
        self.file.write_all(payload)?;
        self.hasher.update(&header);
        self.hasher.update(payload);

        if self.event_count == 0 {
            self.time_start_ns = record.timestamp_ns;
        }
        self.time_start_ns = self.time_start_ns.min(record.timestamp_ns);
        self.time_end_ns = self.time_end_ns.max(record.timestamp_ns);
        self.index_seq_range = Some(match self.index_seq_range {
            None => (index_seq, index_seq),
            Some((lo, hi)) => (lo.min(index_seq), hi.max(index_seq)),
        });
        self.bytes_length += u64::from(total_length);
        let seq = self.event_count;
        self.event_count += 1;
        Ok(seq)
    }

    pub fn flush(&mut self) -> Result<(), TraceFileError> {
        self.file.flush()?;
        Ok(())
    }

    pub fn finalize(&mut self) -> Result<DetailFooter, TraceFileError> {
        if self.finalized {
            return Err(TraceFileError::Finalized);
        }
        self.finalized = true;

        let footer = DetailFooter {
            checksum: self.hasher.clone().finalize(),
            event_count: u64::from(self.event_count),
            bytes_length: self.bytes_length,
            time_start_ns: self.time_start_ns,
            time_end_ns: self.time_end_ns,
        };
        self.file.write_all(&footer.encode())?;

        let (lo, hi) = self.index_seq_range.unwrap_or((0, 0));
        self.header.event_count = u64::from(self.event_count);
        self.header.bytes_length = self.bytes_length;
        self.header.index_seq_start = u64::from(lo);
        self.header.index_seq_end = u64::from(hi);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode())?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(footer)
    }
}
