//! Shared-memory plumbing: named segments, offset resolution and the session
//! control block.

pub mod control;
pub mod segment;

pub use control::{ControlBlock, DrainHealth, SessionState, CONTROL_MAGIC, MAX_SEGMENT_ENTRIES};
pub use segment::{
    align_up, RootedSegment, SharedLayout, ShmRegion, ShmSegment, DEFAULT_SHM_ROOT, LAYOUT_ALIGN, MAX_SEGMENT_NAME,
};
