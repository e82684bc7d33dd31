//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing a registry slot
//! index where an OS thread id is expected, and make function signatures more
//! expressive.

use ada_tracer_common::{EVENT_KIND_CALL, EVENT_KIND_EXCEPTION, EVENT_KIND_RETURN};
use serde::{Deserialize, Serialize};
use std::fmt;

/// OS thread identifier of a traced thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// Function identifier handed over by the instrumentation layer
///
/// By convention `(module_id << 32) | symbol_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionId(pub u64);

impl FunctionId {
    #[must_use]
    pub fn new(module_id: u32, symbol_index: u32) -> Self {
        FunctionId((u64::from(module_id) << 32) | u64::from(symbol_index))
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn module_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn symbol_index(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FN:{:#x}", self.0)
    }
}

/// Position of a thread lane set inside the registry arena
///
/// This is NOT the thread id. Slots are handed out in registration order and
/// never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotIndex(pub u32);

impl SlotIndex {
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SLOT:{}", self.0)
    }
}

/// Capture session identifier, embedded in shared-memory segment names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Kind of traced occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Call,
    Return,
    Exception,
}

impl EventKind {
    /// Wire value stored in index events
    #[must_use]
    pub fn as_raw(self) -> u32 {
        match self {
            EventKind::Call => EVENT_KIND_CALL,
            EventKind::Return => EVENT_KIND_RETURN,
            EventKind::Exception => EVENT_KIND_EXCEPTION,
        }
    }

    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            EVENT_KIND_CALL => Some(EventKind::Call),
            EVENT_KIND_RETURN => Some(EventKind::Return),
            EVENT_KIND_EXCEPTION => Some(EventKind::Exception),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Call => "call",
            EventKind::Return => "return",
            EventKind::Exception => "exception",
        };
        f.write_str(name)
    }
}

/// Where producers send their events
///
/// Progresses `GlobalOnly → DualWrite → PerThreadOnly` while the drain is
/// healthy and falls back to `GlobalOnly` when its heartbeat goes stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Shared fallback lane only
    GlobalOnly,
    /// Per-thread lanes, mirrored into the shared lane
    DualWrite,
    /// Per-thread lanes only
    PerThreadOnly,
}

impl SessionMode {
    #[must_use]
    pub fn as_raw(self) -> u32 {
        match self {
            SessionMode::GlobalOnly => 0,
            SessionMode::DualWrite => 1,
            SessionMode::PerThreadOnly => 2,
        }
    }

    /// Unknown values decode as the safest mode
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => SessionMode::DualWrite,
            2 => SessionMode::PerThreadOnly,
            _ => SessionMode::GlobalOnly,
        }
    }

    #[must_use]
    pub fn writes_thread_lanes(self) -> bool {
        !matches!(self, SessionMode::GlobalOnly)
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionMode::GlobalOnly => "global_only",
            SessionMode::DualWrite => "dual_write",
            SessionMode::PerThreadOnly => "per_thread_only",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_id_parts() {
        let id = FunctionId::new(3, 17);
        assert_eq!(id.module_id(), 3);
        assert_eq!(id.symbol_index(), 17);
        assert_eq!(id.to_string(), "FN:0x300000011");
    }

    #[test]
    fn test_event_kind_raw_values() {
        assert_eq!(EventKind::Call.as_raw(), 1);
        assert_eq!(EventKind::Return.as_raw(), 2);
        assert_eq!(EventKind::Exception.as_raw(), 3);
        assert_eq!(EventKind::from_raw(2), Some(EventKind::Return));
        assert_eq!(EventKind::from_raw(9), None);
    }

    #[test]
    fn test_session_mode_unknown_is_global() {
        assert_eq!(SessionMode::from_raw(77), SessionMode::GlobalOnly);
        assert_eq!(SessionMode::from_raw(SessionMode::DualWrite.as_raw()), SessionMode::DualWrite);
        assert!(!SessionMode::GlobalOnly.writes_thread_lanes());
    }

    #[test]
    fn test_display_formats() {
        assert_eq!(ThreadId(42).to_string(), "TID:42");
        assert_eq!(SlotIndex(3).to_string(), "SLOT:3");
        assert_eq!(SessionMode::PerThreadOnly.to_string(), "per_thread_only");
    }
}
