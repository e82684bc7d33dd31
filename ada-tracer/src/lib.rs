//! # ADA Tracer - Low-Overhead Function-Call Tracer Core
//!
//! Records function-call activity (call, return, exception) from many threads
//! of a traced process into per-thread lock-free rings in shared memory. A
//! single drain consumer, in the same process or another one, persists the
//! events into a pair of binary trace files: a compact `index.atf` stream and
//! an optional `detail.atf` stream of larger payloads, cross-linked by
//! sequence number.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Traced threads (producers)                      │
//! │        Tracer::on_occurrence(thread, function, kind, ...)       │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ never blocks, never panics
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Shared memory (file-backed)                    │
//! │                                                                 │
//! │  ┌──────────────┐  ┌───────────────────────┐  ┌──────────┐      │
//! │  │ ControlBlock │  │ ThreadRegistry        │  │  Global  │      │
//! │  │ state, mode, │  │  slot 0: index lane   │  │   lane   │      │
//! │  │ heartbeat,   │  │          detail lane  │  │(fallback)│      │
//! │  │ window       │  │  slot 1: ...          │  │          │      │
//! │  └──────────────┘  └───────────────────────┘  └──────────┘      │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ submitted rings
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Drain (one consumer)                       │
//! │   pair index ↔ detail ──▶ TraceWriter ──▶ index.atf/detail.atf  │
//! │   MetricsCollector ──▶ session.json                             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Shared memory and lanes
//!
//! - [`shm`]: file-backed segments, bounds-checked regions, the control block
//! - [`ring`]: SPSC ring of fixed-size records addressed by offsets
//! - [`lane`]: ring pool with active/submit/free queues and swap
//! - [`registry`]: thread slots, each owning an index and a detail lane
//! - [`global_lane`]: shared fallback lane used while the drain is not ready
//! - [`backpressure`]: per-lane Normal/Pressure/Dropping/Recovery controller
//!
//! ### Producer and consumer
//!
//! - [`tracer`]: event ingress and session mode selection
//! - [`drain`]: pairing, persistence, finalization, `session.json`
//! - [`atf`]: ATF v2 file formats, writers and a recovering reader
//! - [`metrics`]: per-thread counters, rates, global snapshots
//!
//! ### Support
//!
//! - [`session`]: creates or attaches to the set of segments
//! - [`config`]: session configuration (JSON file + CLI overrides)
//! - [`workload`]: synthetic call trees for demos and tests
//! - [`cli`]: command-line argument parsing
//! - [`domain`]: core domain types and errors
//!
//! ## Session Modes
//!
//! 1. **`GlobalOnly`**: producers write only the global lane (drain not ready)
//! 2. **`DualWrite`**: per-thread lanes plus a mirrored global record
//! 3. **`PerThreadOnly`**: per-thread lanes only
//!
//! A stale drain heartbeat makes producers fall back to the global lane.
//!
//! ## Typical Usage
//!
//! ```bash
//! # Synthetic in-process run
//! ./ada-tracer record --threads 8 --out ./trace
//!
//! # Verify the files
//! ./ada-tracer inspect ./trace
//! ```

pub mod atf;
pub mod backpressure;
pub mod cli;
pub mod clock;
pub mod config;
pub mod domain;
pub mod drain;
pub mod global_lane;
pub mod lane;
pub mod metrics;
pub mod registry;
pub mod ring;
pub mod session;
pub mod shm;
pub mod tracer;
pub mod workload;

pub use config::SessionConfig;
pub use session::Session;
pub use tracer::{Occurrence, OccurrenceSink, Tracer};
