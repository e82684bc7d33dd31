//! # Tracing session
//!
//! A session is three named segments under the shm root:
//!
//! ```text
//! /ada-<name>-control    ControlBlock: state, heartbeat, mode, window, directory
//! /ada-<name>-registry   RegistryHeader + lane sets + ring arena
//! /ada-<name>-global     shared fallback lane
//! ```
//!
//! The creator lists the other two in the control block's directory, so a
//! drain in another process only needs the control segment's name to attach.
//! Segments are unlinked when the creating `Session` is dropped.

use crate::clock;
use crate::config::SessionConfig;
use crate::domain::{SessionError, SessionId, SetupError};
use crate::global_lane::GlobalLane;
use crate::registry::ThreadRegistry;
use crate::shm::{align_up, ControlBlock, RootedSegment, SessionState, ShmSegment, LAYOUT_ALIGN};
use log::info;
use std::mem::size_of;
use std::path::Path;

const CONTROL_SUFFIX: &str = "-control";
const REGISTRY_SUFFIX: &str = "-registry";
const GLOBAL_SUFFIX: &str = "-global";

/// Name of a session's control segment
#[must_use]
pub fn control_segment_name(session: &str) -> String {
    format!("/ada-{session}{CONTROL_SUFFIX}")
}

fn segment_name(session: &str, suffix: &str) -> String {
    format!("/ada-{session}{suffix}")
}

pub struct Session {
    name: String,
    config: SessionConfig,
    control: RootedSegment<ControlBlock>,
    registry: ThreadRegistry,
    global: GlobalLane,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("session_id", &self.session_id())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create every segment of a new session. The session stays in
    /// `Initializing` until [`Session::start`].
    pub fn create(config: SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let name = config.name.clone().unwrap_or_else(|| std::process::id().to_string());
        let root = config.shm_root.as_path();
        let session_id = SessionId((u64::from(std::process::id()) << 32) ^ clock::now_ns());

        let control_size = align_up(size_of::<ControlBlock>() as u64, LAYOUT_ALIGN);
        let control = RootedSegment::<ControlBlock>::new(ShmSegment::create(
            root,
            &segment_name(&name, CONTROL_SUFFIX),
            control_size,
        )?)?;

        let registry_name = segment_name(&name, REGISTRY_SUFFIX);
        let registry_size = ThreadRegistry::required_size(&config.registry);
        let registry = ThreadRegistry::create(
            ShmSegment::create(root, &registry_name, registry_size)?,
            &config.registry,
            &config.backpressure,
            session_id,
        )?;

        let global_name = segment_name(&name, GLOBAL_SUFFIX);
        let global_size = GlobalLane::required_size(config.registry.global_ring_capacity);
        let global =
            GlobalLane::create(ShmSegment::create(root, &global_name, global_size)?, config.registry.global_ring_capacity)?;

        let block = control.root();
        block.init(session_id, config.drain.initial_mode, config.drain.stall_timeout_ms.saturating_mul(1_000_000));
        block.add_entry(&registry_name, registry_size)?;
        block.add_entry(&global_name, global_size)?;

        info!(
            "session {name} created ({session_id}): {} thread slots, {} registry bytes",
            config.registry.max_threads, registry_size
        );
        Ok(Self { name, config, control, registry, global })
    }

    /// Attach to the session named by `config.name` under `config.shm_root`
    pub fn attach(config: SessionConfig) -> Result<Self, SessionError> {
        let Some(name) = config.name.clone() else {
            return Err(SetupError::InvalidConfig("attaching needs a session name".to_string()).into());
        };
        let root = config.shm_root.as_path();
        let control = RootedSegment::<ControlBlock>::new(ShmSegment::open(root, &control_segment_name(&name))?)?;
        control.root().validate()?;

        let registry = ThreadRegistry::attach(open_listed(root, control.root(), REGISTRY_SUFFIX)?)?;
        if registry.session_id() != control.root().session_id() {
            return Err(SetupError::LayoutMismatch(format!(
                "registry belongs to session {}, control block to {}",
                registry.session_id(),
                control.root().session_id()
            ))
            .into());
        }
        let global = GlobalLane::attach(open_listed(root, control.root(), GLOBAL_SUFFIX)?)?;
        info!("attached to session {name} ({})", control.root().session_id());
        Ok(Self { name, config, control, registry, global })
    }

    /// Arm the capture window and open the session to producers
    pub fn start(&self) {
        let control = self.control();
        control.set_index_enabled(self.config.capture.index_lane);
        control.set_detail_enabled(self.config.capture.detail_lane);
        match self.config.capture.window {
            Some(window) => control.arm_window(
                clock::now_ns(),
                window.pre_roll_ms.saturating_mul(1_000_000),
                window.post_roll_ms.saturating_mul(1_000_000),
            ),
            None => control.arm_unbounded(),
        }
        control.set_state(SessionState::Running);
        info!("session {} running", self.name);
    }

    /// Ask producers and the drain to wind down
    pub fn stop(&self) {
        self.registry.stop_accepting();
        self.registry.request_shutdown();
        self.control().request_shutdown();
        if self.control().state() == SessionState::Running {
            self.control().set_state(SessionState::Stopping);
        }
        info!("session {} stopping", self.name);
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.control().session_id()
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn control(&self) -> &ControlBlock {
        self.control.root()
    }

    #[must_use]
    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    #[must_use]
    pub fn global_lane(&self) -> &GlobalLane {
        &self.global
    }

    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.control.segment().is_owner()
    }
}

fn open_listed(root: &Path, control: &ControlBlock, suffix: &str) -> Result<ShmSegment, SetupError> {
    let (name, size) = control.find_entry(suffix).ok_or_else(|| SetupError::SegmentNotFound(suffix.to_string()))?;
    let segment = ShmSegment::open(root, &name)?;
    if segment.len() < size {
        return Err(SetupError::RegionTooSmall { needed: size, available: segment.len() });
    }
    Ok(segment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::domain::{SessionMode, ThreadId};

    fn config(root: &Path) -> SessionConfig {
        SessionConfig {
            name: Some("unit".to_string()),
            shm_root: root.to_path_buf(),
            registry: RegistryConfig { max_threads: 4, ..RegistryConfig::default() },
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_create_then_attach_shares_state() {
        let dir = tempfile::tempdir().unwrap();
        let owner = Session::create(config(dir.path())).unwrap();
        owner.start();
        owner.registry().register(ThreadId(11)).unwrap();

        let peer = Session::attach(config(dir.path())).unwrap();
        assert!(!peer.is_owner());
        assert_eq!(peer.session_id(), owner.session_id());
        assert_eq!(peer.control().state(), SessionState::Running);
        assert_eq!(peer.control().mode(), SessionMode::GlobalOnly);
        assert!(peer.registry().lookup(ThreadId(11)).is_some());
        assert_eq!(peer.control().entries().len(), 2);

        peer.stop();
        assert!(owner.control().shutdown_requested());
        assert!(owner.registry().register(ThreadId(12)).is_none());
    }

    #[test]
    fn test_segments_removed_with_owner() {
        let dir = tempfile::tempdir().unwrap();
        drop(Session::create(config(dir.path())).unwrap());
        assert!(Session::attach(config(dir.path())).is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_attach_needs_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.name = None;
        assert!(Session::attach(cfg).is_err());
    }
}
