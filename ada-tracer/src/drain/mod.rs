//! Single consumer: moves captured events from shared memory into trace files

pub mod manifest;
pub mod thread;
pub mod worker;

pub use manifest::{SessionManifest, MANIFEST_FILE_NAME};
pub use thread::DrainThread;
pub use worker::{DrainReport, DrainStats, DrainWorker};
