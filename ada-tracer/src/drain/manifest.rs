//! `session.json` written next to the trace files

use super::worker::DrainStats;
use crate::atf::TraceSummary;
use crate::domain::{SessionId, SessionMode, TraceFileError};
use crate::global_lane::GlobalLaneStats;
use crate::metrics::GlobalMetricsSnapshot;
use crate::session::Session;
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE_NAME: &str = "session.json";

#[derive(Debug, Clone, Serialize)]
pub struct SessionManifest {
    pub session: String,
    pub session_id: SessionId,
    pub final_mode: SessionMode,
    pub max_threads: u32,
    pub registered_threads: u32,
    pub registration_failures: u64,
    pub trace: TraceSummary,
    pub drain: DrainStats,
    pub global_lane: GlobalLaneStats,
    pub metrics: GlobalMetricsSnapshot,
}

impl SessionManifest {
    #[must_use]
    pub fn new(session: &Session, trace: TraceSummary, drain: DrainStats, metrics: GlobalMetricsSnapshot) -> Self {
        let registry = session.registry();
        Self {
            session: session.name().to_string(),
            session_id: session.session_id(),
            final_mode: session.control().mode(),
            max_threads: registry.capacity(),
            registered_threads: registry.registered_count(),
            registration_failures: registry.registration_failures(),
            trace,
            drain,
            global_lane: session.global_lane().stats(),
            metrics,
        }
    }

    /// Write pretty-printed JSON into `dir`, returning the file path
    pub fn write(&self, dir: &Path) -> Result<PathBuf, TraceFileError> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(path)
    }
}
