//! ATF v2 trace files: layout, writers and the recovering reader

pub mod detail_writer;
pub mod format;
pub mod index_writer;
pub mod reader;
pub mod writer;

pub use detail_writer::DetailWriter;
pub use format::{DetailEventHeader, DetailFooter, DetailHeader, IndexFooter, IndexHeader};
pub use index_writer::IndexWriter;
pub use reader::{DetailEvent, DetailTrace, LinkReport, RecoveryStatus, TraceReader};
pub use writer::{TraceSummary, TraceWriter, DETAIL_FILE_NAME, INDEX_FILE_NAME};
