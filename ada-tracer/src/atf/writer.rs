//! Paired index/detail writer
//!
//! Owns `index.atf` and, once the first detail event arrives, `detail.atf`.
//! Sequences are file positions: the index event's `detail_seq` is the detail
//! event's position and the detail event's `index_seq` is the index event's
//! position, so links resolve without any lookup table.

use super::detail_writer::DetailWriter;
use super::format::{DetailFooter, DetailHeader, IndexFooter, IndexHeader};
use super::index_writer::IndexWriter;
use crate::clock;
use crate::domain::TraceFileError;
use ada_tracer_common::{DetailRecord, IndexEvent, NO_DETAIL_SEQ};
use log::{debug, info};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const INDEX_FILE_NAME: &str = "index.atf";
pub const DETAIL_FILE_NAME: &str = "detail.atf";

/// Totals reported once both files are closed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TraceSummary {
    pub index_events: u64,
    pub detail_events: u64,
    pub linked_events: u64,
    pub index_bytes: u64,
    pub detail_bytes: u64,
    pub time_start_ns: u64,
    pub time_end_ns: u64,
    pub index_checksum: u32,
    pub detail_checksum: Option<u32>,
}

#[derive(Debug)]
pub struct TraceWriter {
    dir: PathBuf,
    thread_id: u32,
    index: IndexWriter,
    detail: Option<DetailWriter>,
    linked: u64,
    summary: Option<TraceSummary>,
}

impl TraceWriter {
    /// Create `dir` if needed and open `index.atf` inside it. `thread_id` 0
    /// marks a session-wide file.
    pub fn create(dir: &Path, thread_id: u32) -> Result<Self, TraceFileError> {
        std::fs::create_dir_all(dir)?;
        let header = IndexHeader::placeholder(clock::host_arch(), clock::host_os(), thread_id, clock::host_clock());
        let index = IndexWriter::create(&dir.join(INDEX_FILE_NAME), header)?;
        debug!("trace index opened at {}", index.path().display());
        Ok(Self { dir: dir.to_path_buf(), thread_id, index, detail: None, linked: 0, summary: None })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn index_count(&self) -> u32 {
        self.index.event_count()
    }

    #[must_use]
    pub fn detail_count(&self) -> u32 {
        self.detail.as_ref().map_or(0, DetailWriter::event_count)
    }

    #[must_use]
    pub fn has_detail_file(&self) -> bool {
        self.detail.is_some()
    }

    fn detail_writer(&mut self) -> Result<&mut DetailWriter, TraceFileError> {
        if self.detail.is_none() {
            let header = DetailHeader::placeholder(clock::host_arch(), clock::host_os(), self.thread_id);
            let writer = DetailWriter::create(&self.dir.join(DETAIL_FILE_NAME), header)?;
            debug!("trace detail opened at {}", writer.path().display());
            self.index.set_has_detail_file()?;
            self.detail = Some(writer);
        }
        self.detail.as_mut().ok_or(TraceFileError::Finalized)
    }

    /// Write an index event with no detail. Returns its index position.
    pub fn write_unlinked(&mut self, event: &IndexEvent) -> Result<u32, TraceFileError> {
        let event = IndexEvent { detail_seq: NO_DETAIL_SEQ, ..*event };
        self.index.append(&event)
    }

    /// Write a detail event and its index event with links in both directions.
    /// Returns `(index_seq, detail_seq)`.
    pub fn write_linked(&mut self, event: &IndexEvent, detail: &DetailRecord) -> Result<(u32, u32), TraceFileError> {
        let index_seq = self.index.event_count();
        let detail_seq = self.detail_writer()?.append(detail, index_seq)?;
        let written = self.index.append(&IndexEvent { detail_seq, ..*event })?;
        self.linked += 1;
        Ok((written, detail_seq))
    }

    pub fn flush(&mut self) -> Result<(), TraceFileError> {
        self.index.flush()?;
        if let Some(detail) = self.detail.as_mut() {
            detail.flush()?;
        }
        Ok(())
    }

    /// Close both files with footers and true headers
    pub fn finalize(&mut self) -> Result<TraceSummary, TraceFileError> {
        if let Some(summary) = self.summary {
            return Ok(summary);
        }
        let detail_footer: Option<DetailFooter> = match self.detail.as_mut() {
            Some(detail) => Some(detail.finalize()?),
            None => None,
        };
        let index_footer: IndexFooter = self.index.finalize()?;

        let mut summary = TraceSummary {
            index_events: index_footer.event_count,
            linked_events: self.linked,
            index_bytes: index_footer.bytes_written,
            time_start_ns: index_footer.time_start_ns,
            time_end_ns: index_footer.time_end_ns,
            index_checksum: index_footer.checksum,
            ..TraceSummary::default()
        };
        if let Some(footer) = detail_footer {
            summary.detail_events = footer.event_count;
            summary.detail_bytes = footer.bytes_length;
            summary.detail_checksum = Some(footer.checksum);
        }
        info!(
            "trace finalized: {} index events, {} detail events in {}",
            summary.index_events,
            summary.detail_events,
            self.dir.display()
        );
        self.summary = Some(summary);
        Ok(summary)
    }
}
