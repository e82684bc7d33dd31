//! Synthetic call trees fed through an [`OccurrenceSink`]
//!
//! Stands in for the instrumentation layer in demos and tests. Each worker
//! thread emits balanced call/return pairs nesting up to `max_depth`, with a
//! detail payload on every `detail_every`-th occurrence.

use crate::clock;
use crate::domain::{EventKind, FunctionId, ThreadId};
use crate::tracer::{Occurrence, OccurrenceSink};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticWorkload {
    pub threads: u32,
    /// Occurrences per thread, rounded down to whole call/return pairs
    pub events_per_thread: u32,
    pub max_depth: u32,
    /// 0 disables detail payloads
    pub detail_every: u32,
    pub payload_len: usize,
    /// Thread ids are `first_thread_id..first_thread_id + threads`
    pub first_thread_id: u32,
}

impl Default for SyntheticWorkload {
    fn default() -> Self {
        Self {
            threads: 4,
            events_per_thread: 10_000,
            max_depth: 8,
            detail_every: 16,
            payload_len: 128,
            first_thread_id: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkloadReport {
    pub attempted: u64,
    pub captured: u64,
    pub with_detail: u64,
}

impl WorkloadReport {
    fn merge(&mut self, other: WorkloadReport) {
        self.attempted += other.attempted;
        self.captured += other.captured;
        self.with_detail += other.with_detail;
    }
}

/// Cheap deterministic scramble deciding the tree shape
fn mix(step: u32) -> u32 {
    step.wrapping_mul(2_654_435_761) >> 16
}

impl SyntheticWorkload {
    /// Run every worker to completion on scoped threads
    pub fn run<S: OccurrenceSink + Sync>(&self, sink: &S) -> WorkloadReport {
        let mut total = WorkloadReport::default();
        std::thread::scope(|scope| {
            let workers: Vec<_> = (0..self.threads)
                .map(|i| {
                    let thread_id = ThreadId(self.first_thread_id.wrapping_add(i));
                    scope.spawn(move || self.run_thread(sink, thread_id, i))
                })
                .collect();
            for worker in workers {
                if let Ok(report) = worker.join() {
                    total.merge(report);
                }
            }
        });
        total
    }

    /// Emit one thread's occurrences on the calling thread
    pub fn run_thread<S: OccurrenceSink>(&self, sink: &S, thread_id: ThreadId, module: u32) -> WorkloadReport {
        let mut report = WorkloadReport::default();
        #[allow(clippy::cast_possible_truncation)]
        let payload: Vec<u8> = (0..self.payload_len).map(|b| (b % 251) as u8).collect();
        let max_depth = self.max_depth.max(1);
        let mut stack: Vec<FunctionId> = Vec::with_capacity(max_depth as usize);
        let mut next_symbol = 0u32;

        // Calls still open never exceed the occurrences left, so every
        // call is matched by a return
        let mut remaining = self.events_per_thread / 2 * 2;
        let mut step = 0u32;
        while remaining > 0 {
            #[allow(clippy::cast_possible_truncation)]
            let open = stack.len() as u32;
            let descend = open == 0 || (remaining > open && open < max_depth && mix(step) % 4 != 0);
            let (kind, function_id) = if descend {
                let id = FunctionId::new(module, next_symbol);
                next_symbol = next_symbol.wrapping_add(1);
                stack.push(id);
                (EventKind::Call, id)
            } else {
                let Some(id) = stack.pop() else {
                    break;
                };
                (EventKind::Return, id)
            };
            remaining -= 1;
            step += 1;

            let detail = (self.detail_every != 0 && step % self.detail_every == 0).then_some(payload.as_slice());
            let occurrence = Occurrence { thread_id, function_id, kind, timestamp_ns: clock::now_ns(), detail };
            report.attempted += 1;
            if sink.on_occurrence(&occurrence) {
                report.captured += 1;
                if detail.is_some() {
                    report.with_detail += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(ThreadId, EventKind, bool)>>,
    }

    impl OccurrenceSink for Recorder {
        fn on_occurrence(&self, occurrence: &Occurrence<'_>) -> bool {
            self.seen.lock().unwrap().push((occurrence.thread_id, occurrence.kind, occurrence.detail.is_some()));
            true
        }
    }

    #[test]
    fn test_calls_and_returns_balance() {
        let workload = SyntheticWorkload { threads: 1, events_per_thread: 100, detail_every: 10, ..Default::default() };
        let recorder = Recorder::default();
        let report = workload.run(&recorder);
        assert_eq!(report.attempted, 100);
        assert_eq!(report.with_detail, 10);

        let seen = recorder.seen.lock().unwrap();
        let mut depth = 0i64;
        for (_, kind, _) in seen.iter() {
            depth += if *kind == EventKind::Call { 1 } else { -1 };
            assert!(depth >= 0);
            assert!(depth <= 8);
        }
        assert_eq!(depth, 0);
    }

    #[test]
    fn test_threads_use_distinct_ids() {
        let workload = SyntheticWorkload { threads: 3, events_per_thread: 10, ..Default::default() };
        let recorder = Recorder::default();
        assert_eq!(workload.run(&recorder).captured, 30);
        let seen = recorder.seen.lock().unwrap();
        let mut ids: Vec<u32> = seen.iter().map(|(t, _, _)| t.0).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids, vec![1_000, 1_001, 1_002]);
    }
}
