//! Session configuration
//!
//! Every section has working defaults; a JSON file may override any subset of
//! fields, and CLI flags override the file.

use crate::backpressure::DropPolicy;
use crate::domain::{SessionMode, SetupError};
use crate::lane::{MAX_RINGS_PER_LANE, MIN_RINGS_PER_LANE};
use crate::shm::DEFAULT_SHM_ROOT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Hard upper bound on registry capacity
pub const MAX_THREADS: u32 = 256;

/// Default registry capacity
pub const DEFAULT_MAX_THREADS: u32 = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Short label used in segment names; defaults to the process id
    pub name: Option<String>,
    /// Directory backing shared-memory segments
    pub shm_root: PathBuf,
    /// Directory receiving `index.atf`, `detail.atf` and `session.json`
    pub output_dir: PathBuf,
    pub registry: RegistryConfig,
    pub backpressure: BackpressureConfig,
    pub drain: DrainConfig,
    pub capture: CaptureConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: None,
            shm_root: PathBuf::from(DEFAULT_SHM_ROOT),
            output_dir: PathBuf::from("ada-trace"),
            registry: RegistryConfig::default(),
            backpressure: BackpressureConfig::default(),
            drain: DrainConfig::default(),
            capture: CaptureConfig::default(),
        }
    }
}

/// Registry and ring-pool geometry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub max_threads: u32,
    pub index_rings: u32,
    /// Index events per ring (power of two)
    pub index_ring_capacity: u32,
    pub detail_rings: u32,
    /// Detail records per ring (power of two)
    pub detail_ring_capacity: u32,
    /// Records in the shared fallback lane (power of two)
    pub global_ring_capacity: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_MAX_THREADS,
            index_rings: 4,
            // 64 KiB of 32-byte events
            index_ring_capacity: 2048,
            detail_rings: 2,
            // 256 KiB of 512-byte records
            detail_ring_capacity: 512,
            global_ring_capacity: 8192,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Free rings at or below this share of the pool enter pressure
    pub low_watermark_pct: u8,
    /// Free rings at or above this share of the pool allow recovery
    pub high_watermark_pct: u8,
    /// How long the pool must stay above the high watermark before recovering
    pub stability_window_ms: u64,
    pub policy: DropPolicy,
    /// Spins the producer may spend waiting for a free ring under pressure
    pub pressure_spin_limit: u32,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            low_watermark_pct: 25,
            high_watermark_pct: 75,
            stability_window_ms: 100,
            policy: DropPolicy::DropNewest,
            pressure_spin_limit: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    pub poll_interval_ms: u64,
    pub metrics_interval_ms: u64,
    /// Sliding window for rate calculation
    pub rate_window_ms: u64,
    /// Heartbeat age after which producers fall back to the shared lane
    pub stall_timeout_ms: u64,
    /// Healthy dual-write passes before dropping the shared lane
    pub promote_after_passes: u32,
    /// Index events held per thread while waiting for their detail
    pub max_pending_events: usize,
    pub initial_mode: SessionMode,
    pub write_manifest: bool,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            metrics_interval_ms: 100,
            rate_window_ms: 1_000,
            stall_timeout_ms: 1_000,
            promote_after_passes: 2,
            max_pending_events: 65_536,
            initial_mode: SessionMode::GlobalOnly,
            write_manifest: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub index_lane: bool,
    pub detail_lane: bool,
    /// Detail capture window; `None` keeps the window armed for the whole session
    pub window: Option<WindowConfig>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { index_lane: true, detail_lane: true, window: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub pre_roll_ms: u64,
    pub post_roll_ms: u64,
}

fn check_ring(what: &str, count: u32, capacity: u32) -> Result<(), SetupError> {
    if !(MIN_RINGS_PER_LANE..=MAX_RINGS_PER_LANE).contains(&(count as usize)) {
        return Err(SetupError::InvalidConfig(format!(
            "{what}: ring count {count} must be between {MIN_RINGS_PER_LANE} and {MAX_RINGS_PER_LANE}"
        )));
    }
    if capacity == 0 || !capacity.is_power_of_two() {
        return Err(SetupError::InvalidCapacity(capacity));
    }
    Ok(())
}

impl SessionConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self, SetupError> {
        let text = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        let reg = &self.registry;
        if reg.max_threads == 0 || reg.max_threads > MAX_THREADS {
            return Err(SetupError::InvalidConfig(format!(
                "max_threads {} must be between 1 and {MAX_THREADS}",
                reg.max_threads
            )));
        }
        check_ring("index lane", reg.index_rings, reg.index_ring_capacity)?;
        check_ring("detail lane", reg.detail_rings, reg.detail_ring_capacity)?;
        if reg.global_ring_capacity == 0 || !reg.global_ring_capacity.is_power_of_two() {
            return Err(SetupError::InvalidCapacity(reg.global_ring_capacity));
        }

        let bp = &self.backpressure;
        if bp.low_watermark_pct >= bp.high_watermark_pct || bp.high_watermark_pct > 100 {
            return Err(SetupError::InvalidConfig(format!(
                "watermarks must satisfy low < high <= 100 (got {} / {})",
                bp.low_watermark_pct, bp.high_watermark_pct
            )));
        }

        if self.drain.poll_interval_ms == 0 {
            return Err(SetupError::InvalidConfig("poll_interval_ms must be non-zero".to_string()));
        }
        if self.drain.max_pending_events == 0 {
            return Err(SetupError::InvalidConfig("max_pending_events must be non-zero".to_string()));
        }
        if let Some(name) = &self.name {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                return Err(SetupError::InvalidConfig(format!("session name {name:?} must be [A-Za-z0-9_-]+")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        SessionConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_non_power_of_two_ring() {
        let mut config = SessionConfig::default();
        config.registry.index_ring_capacity = 1000;
        assert!(matches!(config.validate(), Err(SetupError::InvalidCapacity(1000))));
    }

    #[test]
    fn test_rejects_oversized_registry() {
        let mut config = SessionConfig::default();
        config.registry.max_threads = MAX_THREADS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ada.json");
        std::fs::write(&path, r#"{"registry": {"max_threads": 8}, "backpressure": {"policy": "drop_oldest"}}"#)
            .unwrap();
        let config = SessionConfig::from_file(&path).unwrap();
        assert_eq!(config.registry.max_threads, 8);
        assert_eq!(config.registry.index_rings, 4);
        assert_eq!(config.backpressure.policy, DropPolicy::DropOldest);
        assert_eq!(config.drain.initial_mode, SessionMode::GlobalOnly);
    }

    #[test]
    fn test_rejects_bad_session_name() {
        let config = SessionConfig { name: Some("a/b".to_string()), ..SessionConfig::default() };
        assert!(config.validate().is_err());
    }
}
