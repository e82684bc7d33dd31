//! Per-thread counters, rate calculation and the drain-side collector

pub mod collector;
pub mod rate;
pub mod thread;

pub use collector::{GlobalMetricsSnapshot, MetricsCollector, ThreadMetricsEntry};
pub use rate::{RateCalculator, RATE_HISTORY};
pub use thread::{SwapToken, ThreadMetrics, ThreadMetricsSnapshot};
