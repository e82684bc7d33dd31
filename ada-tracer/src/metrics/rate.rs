//! Sliding-window rate calculator
//!
//! Keeps a bounded history of `(timestamp, events, bytes)` samples of
//! monotonically growing totals. Samples older than the window (relative to
//! the newest) are discarded; rates are the deltas between the oldest and
//! newest retained samples divided by the elapsed time.

use std::collections::VecDeque;

/// Samples retained per calculator
pub const RATE_HISTORY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSample {
    pub timestamp_ns: u64,
    pub events: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct RateCalculator {
    samples: VecDeque<RateSample>,
    window_ns: u64,
}

impl RateCalculator {
    #[must_use]
    pub fn new(window_ns: u64) -> Self {
        Self { samples: VecDeque::with_capacity(RATE_HISTORY), window_ns }
    }

    /// Add a sample of cumulative totals. Out-of-order samples are ignored.
    pub fn add_sample(&mut self, timestamp_ns: u64, events: u64, bytes: u64) {
        if let Some(last) = self.samples.back() {
            if timestamp_ns < last.timestamp_ns {
                return;
            }
        }
        if self.samples.len() == RATE_HISTORY {
            self.samples.pop_front();
        }
        self.samples.push_back(RateSample { timestamp_ns, events, bytes });

        let cutoff = timestamp_ns.saturating_sub(self.window_ns);
        while self.samples.len() > 1 && self.samples.front().is_some_and(|s| s.timestamp_ns < cutoff) {
            self.samples.pop_front();
        }
    }

    /// `(events_per_second, bytes_per_second)`, zero with fewer than two samples
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rates(&self) -> (f64, f64) {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return (0.0, 0.0);
        };
        let dt_ns = last.timestamp_ns.saturating_sub(first.timestamp_ns);
        if dt_ns == 0 {
            return (0.0, 0.0);
        }
        let secs = dt_ns as f64 / 1e9;
        let events = last.events.saturating_sub(first.events) as f64 / secs;
        let bytes = last.bytes.saturating_sub(first.bytes) as f64 / secs;
        (events, bytes)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
