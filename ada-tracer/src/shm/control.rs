//! Session control block
//!
//! The first segment of a session. Both processes map it by name and find the
//! other segments through its directory. It carries the session state, the
//! drain's readiness flag and heartbeat, the advertised session mode, lane
//! enable flags and the detail capture window.

use super::segment::{SharedLayout, MAX_SEGMENT_NAME};
use crate::domain::{SessionId, SessionMode, SetupError};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// "ADCB"
pub const CONTROL_MAGIC: u32 = 0x4144_4342;
pub const CONTROL_VERSION: u32 = 1;

/// Named segments the directory can list
pub const MAX_SEGMENT_ENTRIES: usize = 8;

const NAME_BYTES: usize = MAX_SEGMENT_NAME + 1;

/// Lifecycle of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Running,
    Stopping,
    Finished,
}

impl SessionState {
    fn as_raw(self) -> u32 {
        match self {
            SessionState::Initializing => 0,
            SessionState::Running => 1,
            SessionState::Stopping => 2,
            SessionState::Finished => 3,
        }
    }

    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => SessionState::Running,
            2 => SessionState::Stopping,
            3 => SessionState::Finished,
            _ => SessionState::Initializing,
        }
    }
}

/// One directory entry: POSIX-style name and byte length
#[repr(C)]
pub struct ShmEntry {
    size: AtomicU64,
    name: [AtomicU8; NAME_BYTES],
}

#[repr(C)]
pub struct ControlBlock {
    magic: AtomicU32,
    version: AtomicU32,
    session_state: AtomicU32,
    drain_ready: AtomicU32,
    mode: AtomicU32,
    index_lane_enabled: AtomicU32,
    detail_lane_enabled: AtomicU32,
    window_armed: AtomicU32,
    shutdown_requested: AtomicU32,
    entry_count: AtomicU32,
    _reserved: [AtomicU32; 2],
    session_id: AtomicU64,
    heartbeat_ns: AtomicU64,
    stall_timeout_ns: AtomicU64,
    window_start_ns: AtomicU64,
    window_end_ns: AtomicU64,
    armed_at_ns: AtomicU64,
    entries: [ShmEntry; MAX_SEGMENT_ENTRIES],
}

// SAFETY: repr(C), atomics only, zero is an unpublished block
unsafe impl SharedLayout for ControlBlock {}

/// Drain liveness as seen by a producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainHealth {
    pub ready: bool,
    pub heartbeat_age_ns: u64,
    pub stalled: bool,
}

impl ControlBlock {
    /// Initialize a fresh block. Creator only, before any peer attaches.
    pub fn init(&self, session_id: SessionId, mode: SessionMode, stall_timeout_ns: u64) {
        self.version.store(CONTROL_VERSION, Ordering::Relaxed);
        self.session_id.store(session_id.0, Ordering::Relaxed);
        self.session_state.store(SessionState::Initializing.as_raw(), Ordering::Relaxed);
        self.mode.store(mode.as_raw(), Ordering::Relaxed);
        self.stall_timeout_ns.store(stall_timeout_ns, Ordering::Relaxed);
        self.index_lane_enabled.store(1, Ordering::Relaxed);
        self.detail_lane_enabled.store(1, Ordering::Relaxed);
        self.magic.store(CONTROL_MAGIC, Ordering::Release);
    }

    /// Refuse foreign memory that is not a control block of this version
    pub fn validate(&self) -> Result<(), SetupError> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic != CONTROL_MAGIC {
            return Err(SetupError::BadMagic { what: "control block", expected: CONTROL_MAGIC, found: magic });
        }
        let version = self.version.load(Ordering::Relaxed);
        if version != CONTROL_VERSION {
            return Err(SetupError::VersionMismatch { what: "control block", expected: CONTROL_VERSION, found: version });
        }
        Ok(())
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        SessionId(self.session_id.load(Ordering::Relaxed))
    }

    // ── Segment directory ────────────────────────────────────────────────

    /// Append a directory entry. Creator only.
    pub fn add_entry(&self, name: &str, size: u64) -> Result<(), SetupError> {
        if name.len() > MAX_SEGMENT_NAME {
            return Err(SetupError::NameTooLong(name.to_string()));
        }
        let idx = self.entry_count.load(Ordering::Relaxed) as usize;
        let entry = self.entries.get(idx).ok_or(SetupError::DirectoryFull)?;
        for (slot, byte) in entry.name.iter().zip(name.bytes().chain(std::iter::repeat(0))) {
            slot.store(byte, Ordering::Relaxed);
        }
        entry.size.store(size, Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation)]
        let count = idx as u32 + 1;
        self.entry_count.store(count, Ordering::Release);
        Ok(())
    }

    /// Directory contents as `(name, size)` pairs
    #[must_use]
    pub fn entries(&self) -> Vec<(String, u64)> {
        let count = (self.entry_count.load(Ordering::Acquire) as usize).min(MAX_SEGMENT_ENTRIES);
        self.entries[..count]
            .iter()
            .map(|entry| {
                let bytes: Vec<u8> = entry
                    .name
                    .iter()
                    .map(|b| b.load(Ordering::Relaxed))
                    .take_while(|&b| b != 0)
                    .collect();
                (String::from_utf8_lossy(&bytes).into_owned(), entry.size.load(Ordering::Relaxed))
            })
            .collect()
    }

    /// Find the first entry whose name ends with `suffix`
    #[must_use]
    pub fn find_entry(&self, suffix: &str) -> Option<(String, u64)> {
        self.entries().into_iter().find(|(name, _)| name.ends_with(suffix))
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_raw(self.session_state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SessionState) {
        self.session_state.store(state.as_raw(), Ordering::Release);
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(1, Ordering::Release);
    }

    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire) != 0
    }

    // ── Drain liveness and mode ──────────────────────────────────────────

    pub fn set_drain_ready(&self, ready: bool) {
        self.drain_ready.store(u32::from(ready), Ordering::Release);
    }

    /// Drain heartbeat
    pub fn beat(&self, now_ns: u64) {
        self.heartbeat_ns.store(now_ns, Ordering::Release);
    }

    #[must_use]
    pub fn heartbeat_ns(&self) -> u64 {
        self.heartbeat_ns.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stall_timeout_ns(&self) -> u64 {
        self.stall_timeout_ns.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn health(&self, now_ns: u64) -> DrainHealth {
        let ready = self.drain_ready.load(Ordering::Acquire) != 0;
        let age = now_ns.saturating_sub(self.heartbeat_ns());
        DrainHealth { ready, heartbeat_age_ns: age, stalled: !ready || age > self.stall_timeout_ns() }
    }

    /// Mode advertised by the drain
    #[must_use]
    pub fn mode(&self) -> SessionMode {
        SessionMode::from_raw(self.mode.load(Ordering::Acquire))
    }

    pub fn set_mode(&self, mode: SessionMode) {
        self.mode.store(mode.as_raw(), Ordering::Release);
    }

    /// Mode a producer should use right now: the advertised mode while the
    /// drain is healthy, the shared lane otherwise
    #[must_use]
    pub fn effective_mode(&self, now_ns: u64) -> SessionMode {
        if self.health(now_ns).stalled {
            SessionMode::GlobalOnly
        } else {
            self.mode()
        }
    }

    // ── Lanes and capture window ─────────────────────────────────────────

    #[must_use]
    pub fn index_lane_enabled(&self) -> bool {
        self.index_lane_enabled.load(Ordering::Relaxed) != 0
    }

    pub fn set_index_enabled(&self, enabled: bool) {
        self.index_lane_enabled.store(u32::from(enabled), Ordering::Relaxed);
    }

    #[must_use]
    pub fn detail_lane_enabled(&self) -> bool {
        self.detail_lane_enabled.load(Ordering::Relaxed) != 0
    }

    pub fn set_detail_enabled(&self, enabled: bool) {
        self.detail_lane_enabled.store(u32::from(enabled), Ordering::Relaxed);
    }

    /// Arm a detail window around `now_ns`
    pub fn arm_window(&self, now_ns: u64, pre_roll_ns: u64, post_roll_ns: u64) {
        self.window_start_ns.store(now_ns.saturating_sub(pre_roll_ns), Ordering::Relaxed);
        self.window_end_ns.store(now_ns.saturating_add(post_roll_ns), Ordering::Relaxed);
        self.armed_at_ns.store(now_ns, Ordering::Relaxed);
        self.window_armed.store(1, Ordering::Release);
    }

    /// Arm a window covering every timestamp
    pub fn arm_unbounded(&self) {
        self.window_start_ns.store(0, Ordering::Relaxed);
        self.window_end_ns.store(u64::MAX, Ordering::Relaxed);
        self.armed_at_ns.store(0, Ordering::Relaxed);
        self.window_armed.store(1, Ordering::Release);
    }

    pub fn disarm_window(&self) {
        self.window_armed.store(0, Ordering::Release);
    }

    #[must_use]
    pub fn window_armed(&self) -> bool {
        self.window_armed.load(Ordering::Acquire) != 0
    }

    /// Whether a detail event at `timestamp_ns` should be persisted
    #[must_use]
    pub fn window_covers(&self, timestamp_ns: u64) -> bool {
        if !self.window_armed() {
            return false;
        }
        let start = self.window_start_ns.load(Ordering::Relaxed);
        let end = self.window_end_ns.load(Ordering::Relaxed);
        (start..=end).contains(&timestamp_ns)
    }
}
