//! Structured error types for ada-tracer
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Capacity exhaustion is never an error here; it is reported as a dropped
//! event through metrics.

use thiserror::Error;

/// Failures while creating or attaching to shared state
///
/// Every variant except `Io` and `InvalidConfig` means foreign memory could not
/// be trusted and the attach was refused.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Ring capacity {0} is not a non-zero power of two")]
    InvalidCapacity(u32),

    #[error("Region too small: need {needed} bytes, have {available}")]
    RegionTooSmall { needed: u64, available: u64 },

    #[error("Bad magic in {what}: expected {expected:#x}, found {found:#x}")]
    BadMagic { what: &'static str, expected: u32, found: u32 },

    #[error("Unsupported {what} version {found} (expected {expected})")]
    VersionMismatch { what: &'static str, expected: u32, found: u32 },

    #[error("Element size mismatch: expected {expected}, found {found}")]
    ElementSizeMismatch { expected: u32, found: u32 },

    #[error("Offset {offset} (+{len} bytes) lies outside segment of {segment_size} bytes")]
    OffsetOutOfBounds { offset: u64, len: u64, segment_size: u64 },

    #[error("Offset {offset} is not aligned to {align}")]
    Misaligned { offset: u64, align: usize },

    #[error("Registry layout does not match its header: {0}")]
    LayoutMismatch(String),

    #[error("Segment name too long: {0}")]
    NameTooLong(String),

    #[error("Segment directory is full")]
    DirectoryFull,

    #[error("Segment {0} is not listed in the control block")]
    SegmentNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failures while writing or reading trace files
#[derive(Error, Debug)]
pub enum TraceFileError {
    #[error("Bad magic in {file}: found {found:?}")]
    BadMagic { file: String, found: [u8; 4] },

    #[error("Unsupported trace version {0}")]
    UnsupportedVersion(u8),

    #[error("Unsupported endianness marker {0:#x}")]
    UnsupportedEndian(u8),

    #[error("{0} is truncated")]
    Truncated(String),

    #[error("Checksum mismatch in {file}: footer says {expected:#010x}, events hash to {actual:#010x}")]
    ChecksumMismatch { file: String, expected: u32, actual: u32 },

    #[error("Detail event of {0} bytes exceeds the format limit")]
    DetailTooLarge(usize),

    #[error("Writer already finalized")]
    Finalized,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failures of a whole tracing session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session setup failed: {0}")]
    Setup(#[from] SetupError),

    #[error("Trace output failed: {0}")]
    Trace(#[from] TraceFileError),

    #[error("Session {0} was already finalized")]
    AlreadyFinalized(String),

    #[error("Drain thread panicked")]
    DrainPanicked,
}
