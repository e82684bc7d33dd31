//! Append-only writer for `index.atf`
//!
//! A placeholder header goes out first so a crash leaves a file the reader can
//! recover by scanning. `finalize` appends the footer and then seeks back to
//! rewrite the header with the real counts.

use super::format::{
    encode_index_event, IndexFooter, IndexHeader, HEADER_SIZE, INDEX_EVENT_SIZE, INDEX_FLAG_HAS_DETAIL_FILE,
};
use crate::domain::TraceFileError;
use ada_tracer_common::IndexEvent;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct IndexWriter {
    file: BufWriter<File>,
    path: PathBuf,
    header: IndexHeader,
    hasher: crc32fast::Hasher,
    event_count: u32,
    time_start_ns: u64,
    time_end_ns: u64,
    finalized: bool,
}

impl std::fmt::Debug for IndexWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexWriter")
            .field("path", &self.path)
            .field("event_count", &self.event_count)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

impl IndexWriter {
    pub fn create(path: &Path, header: IndexHeader) -> Result<Self, TraceFileError> {
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(&header.encode())?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            header,
            hasher: crc32fast::Hasher::new(),
            event_count: 0,
            time_start_ns: 0,
            time_end_ns: 0,
            finalized: false,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Events appended so far; also the sequence the next event receives
    #[must_use]
    pub fn event_count(&self) -> u32 {
        self.event_count
    }

    /// Flag the companion detail file in the on-disk header right away, so
    /// a trace that never reaches `finalize` still advertises it
    pub fn set_has_detail_file(&mut self) -> Result<(), TraceFileError> {
        if self.header.flags & INDEX_FLAG_HAS_DETAIL_FILE != 0 {
            return Ok(());
        }
        self.header.flags |= INDEX_FLAG_HAS_DETAIL_FILE;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode())?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    /// Append one event, returning its position in the file
    pub fn append(&mut self, event: &IndexEvent) -> Result<u32, TraceFileError> {
        if self.finalized {
            return Err(TraceFileError::Finalized);
        }
        let bytes = encode_index_event(event);
        self.file.write_all(&bytes)?;
        self.hasher.update(&bytes);

        if self.event_count == 0 {
            self.time_start_ns = event.timestamp_ns;
        }
        self.time_start_ns = self.time_start_ns.min(event.timestamp_ns);
        self.time_end_ns = self.time_end_ns.max(event.timestamp_ns);
        let seq = self.event_count;
        self.event_count += 1;
        Ok(seq)
    }

    pub fn flush(&mut self) -> Result<(), TraceFileError> {
        self.file.flush()?;
        Ok(())
    }

    /// Write the footer and rewrite the header. The writer accepts no more
    /// events afterwards.
    pub fn finalize(&mut self) -> Result<IndexFooter, TraceFileError> {
        if self.finalized {
            return Err(TraceFileError::Finalized);
        }
        self.finalized = true;

        let bytes_written = u64::from(self.event_count) * INDEX_EVENT_SIZE as u64;
        let footer = IndexFooter {
            checksum: self.hasher.clone().finalize(),
            event_count: u64::from(self.event_count),
            time_start_ns: self.time_start_ns,
            time_end_ns: self.time_end_ns,
            bytes_written,
        };
        self.file.write_all(&footer.encode())?;

        self.header.event_count = self.event_count;
        self.header.footer_offset = HEADER_SIZE as u64 + bytes_written;
        self.header.time_start_ns = self.time_start_ns;
        self.header.time_end_ns = self.time_end_ns;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode())?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(footer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atf::format::{IndexFooter, FOOTER_SIZE};
    use ada_tracer_common::{EVENT_KIND_CALL, NO_DETAIL_SEQ};

    fn event(ts: u64) -> IndexEvent {
        IndexEvent {
            timestamp_ns: ts,
            function_id: 1,
            thread_id: 2,
            event_kind: EVENT_KIND_CALL,
            call_depth: 0,
            detail_seq: NO_DETAIL_SEQ,
        }
    }

    #[test]
    fn test_finalize_writes_header_and_footer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.atf");
        let mut writer = IndexWriter::create(&path, IndexHeader::placeholder(1, 4, 0, 3)).unwrap();
        assert_eq!(writer.append(&event(30)).unwrap(), 0);
        assert_eq!(writer.append(&event(10)).unwrap(), 1);
        assert_eq!(writer.append(&event(20)).unwrap(), 2);
        let footer = writer.finalize().unwrap();
        assert!(matches!(writer.append(&event(40)), Err(TraceFileError::Finalized)));

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 3 * INDEX_EVENT_SIZE + FOOTER_SIZE);
        let header = IndexHeader::decode(&bytes).unwrap();
        assert_eq!(header.event_count, 3);
        assert_eq!(header.footer_offset, (bytes.len() - FOOTER_SIZE) as u64);
        assert_eq!((header.time_start_ns, header.time_end_ns), (10, 30));

        let on_disk = IndexFooter::decode(&bytes[bytes.len() - FOOTER_SIZE..]).unwrap();
        assert_eq!(on_disk, footer);
        assert_eq!(on_disk.checksum, crc32fast::hash(&bytes[HEADER_SIZE..bytes.len() - FOOTER_SIZE]));
    }

    #[test]
    fn test_detail_flag_reaches_disk_before_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.atf");
        let mut writer = IndexWriter::create(&path, IndexHeader::placeholder(1, 4, 0, 3)).unwrap();
        writer.append(&event(1)).unwrap();
        writer.set_has_detail_file().unwrap();
        writer.append(&event(2)).unwrap();
        writer.flush().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 2 * INDEX_EVENT_SIZE);
        let header = IndexHeader::decode(&bytes).unwrap();
        assert!(header.has_detail_file());
        assert_eq!(header.event_count, 0);
    }
}
