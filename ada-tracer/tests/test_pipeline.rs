use ada_tracer::atf::{RecoveryStatus, TraceReader, INDEX_FILE_NAME};
use ada_tracer::clock;
use ada_tracer::config::{RegistryConfig, SessionConfig};
use ada_tracer::domain::{EventKind, FunctionId, SessionMode, ThreadId};
use ada_tracer::drain::{DrainThread, DrainWorker, MANIFEST_FILE_NAME};
use ada_tracer::workload::SyntheticWorkload;
use ada_tracer::{Session, Tracer};
use ada_tracer_common::NO_DETAIL_SEQ;
use std::path::Path;
use std::sync::Arc;

fn config(root: &Path, out: &Path, name: &str) -> SessionConfig {
    let mut config = SessionConfig {
        name: Some(name.to_string()),
        shm_root: root.to_path_buf(),
        output_dir: out.to_path_buf(),
        registry: RegistryConfig {
            max_threads: 8,
            index_rings: 4,
            index_ring_capacity: 256,
            detail_rings: 4,
            detail_ring_capacity: 256,
            global_ring_capacity: 4096,
        },
        ..SessionConfig::default()
    };
    config.drain.stall_timeout_ms = 60_000;
    config
}

fn payload(i: u32) -> Vec<u8> {
    i.to_le_bytes().repeat(8)
}

#[test]
fn test_thousand_plain_and_thousand_detailed_events() {
    let shm = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let session = Arc::new(Session::create(config(shm.path(), out.path(), "pipeline")).unwrap());
    session.start();
    let mut worker = DrainWorker::new(Arc::clone(&session)).unwrap();
    for _ in 0..3 {
        worker.run_pass(clock::now_ns()).unwrap();
    }
    assert_eq!(session.control().mode(), SessionMode::PerThreadOnly);

    let tracer = Tracer::new(Arc::clone(&session));
    let thread = ThreadId(4242);
    for i in 0..2000u32 {
        let kind = if i % 2 == 0 { EventKind::Call } else { EventKind::Return };
        let detail = (i >= 1000).then(|| payload(i));
        assert!(tracer.on_occurrence(thread, FunctionId::new(2, i / 2), kind, u64::from(i) + 1, detail.as_deref()));
        if i % 100 == 99 {
            worker.run_pass(clock::now_ns()).unwrap();
        }
    }
    let report = worker.finalize(clock::now_ns()).unwrap();
    assert_eq!(report.summary.index_events, 2000);
    assert_eq!(report.summary.detail_events, 1000);
    assert_eq!(report.stats.global_events_written, 0);

    let reader = TraceReader::open(out.path()).unwrap();
    assert!(reader.is_clean());
    assert!(reader.header.has_detail_file());
    assert_eq!(reader.footer.unwrap().event_count, 2000);
    assert_eq!(reader.events.len(), 2000);
    let links = reader.verify_links();
    assert!(links.is_consistent());
    assert_eq!((links.linked, links.unlinked), (1000, 1000));

    // Positions link both ways and payloads come back intact
    assert!(reader.events[..1000].iter().all(|e| e.detail_seq == NO_DETAIL_SEQ));
    let first_linked = &reader.events[1000];
    assert_eq!(first_linked.detail_seq, 0);
    let detail = &reader.detail_events()[0];
    assert_eq!(detail.header.index_seq, 1000);
    assert_eq!(detail.payload, payload(1000));
    assert!(reader.events.windows(2).all(|w| w[0].timestamp_ns < w[1].timestamp_ns));

    // Losing the footer leaves every event recoverable by scan
    let index_path = out.path().join(INDEX_FILE_NAME);
    let len = std::fs::metadata(&index_path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&index_path).unwrap();
    file.set_len(len - 64).unwrap();
    drop(file);

    let recovered = TraceReader::open(out.path()).unwrap();
    assert_eq!(recovered.status, RecoveryStatus::Recovered);
    assert!(recovered.footer.is_none());
    assert_eq!(recovered.events.len(), 2000);
    assert!(recovered.verify_links().is_consistent());
}

#[test]
fn test_plain_and_detailed_threads_share_one_trace() {
    const PLAIN: ThreadId = ThreadId(100);
    const DETAILED: ThreadId = ThreadId(200);
    let shm = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let session = Arc::new(Session::create(config(shm.path(), out.path(), "two-threads")).unwrap());
    session.start();
    let mut worker = DrainWorker::new(Arc::clone(&session)).unwrap();
    for _ in 0..3 {
        worker.run_pass(clock::now_ns()).unwrap();
    }
    assert_eq!(session.control().mode(), SessionMode::PerThreadOnly);

    // 1,000 events fit in each thread's four 256-event rings without a pass
    let tracer = Tracer::new(Arc::clone(&session));
    std::thread::scope(|scope| {
        for (thread, detailed) in [(PLAIN, false), (DETAILED, true)] {
            let tracer = &tracer;
            scope.spawn(move || {
                for i in 0..1000u32 {
                    let kind = if i % 2 == 0 { EventKind::Call } else { EventKind::Return };
                    let detail = detailed.then(|| payload(i));
                    let ts = u64::from(i) * 2 + u64::from(detailed) + 1;
                    assert!(tracer.on_occurrence(thread, FunctionId::new(3, i / 2), kind, ts, detail.as_deref()));
                }
            });
        }
    });
    let report = worker.finalize(clock::now_ns()).unwrap();
    assert_eq!(report.summary.index_events, 2000);
    assert_eq!(report.summary.detail_events, 1000);
    assert_eq!(report.stats.missing_details + report.stats.orphan_details, 0);

    let reader = TraceReader::open(out.path()).unwrap();
    assert!(reader.is_clean());
    assert_eq!(reader.footer.unwrap().event_count, 2000);
    let links = reader.verify_links();
    assert!(links.is_consistent());
    assert_eq!((links.linked, links.unlinked), (1000, 1000));

    // Every link lands on the detailed thread; the plain thread never links
    for event in &reader.events {
        assert_eq!(event.has_detail(), event.thread_id == DETAILED.0);
    }
    for (pos, detail) in reader.detail_events().iter().enumerate() {
        let owner = &reader.events[detail.header.index_seq as usize];
        assert_eq!(owner.thread_id, DETAILED.0);
        assert_eq!(owner.detail_seq as usize, pos);
        assert_eq!(detail.header.thread_id, DETAILED.0);
        assert_eq!(detail.header.timestamp_ns, owner.timestamp_ns);
    }
    let first = &reader.detail_events()[0];
    assert_eq!(first.payload, payload(0));

    let index_path = out.path().join(INDEX_FILE_NAME);
    let len = std::fs::metadata(&index_path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&index_path).unwrap();
    file.set_len(len - 64).unwrap();
    drop(file);

    let recovered = TraceReader::open(out.path()).unwrap();
    assert_eq!(recovered.status, RecoveryStatus::Recovered);
    assert_eq!(recovered.events.len(), 2000);
    let links = recovered.verify_links();
    assert!(links.is_consistent());
    assert_eq!(links.linked, 1000);
}

#[test]
fn test_background_drain_with_concurrent_producers() {
    let shm = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let mut config = config(shm.path(), out.path(), "concurrent");
    config.drain.poll_interval_ms = 1;
    let session = Arc::new(Session::create(config).unwrap());
    session.start();
    let drain = DrainThread::spawn(DrainWorker::new(Arc::clone(&session)).unwrap()).unwrap();

    let workload = SyntheticWorkload { threads: 4, events_per_thread: 5_000, detail_every: 8, ..Default::default() };
    let tracer = Tracer::new(Arc::clone(&session));
    let produced = workload.run(&tracer);
    session.stop();
    let report = drain.stop().unwrap();

    assert_eq!(produced.attempted, 20_000);
    assert_eq!(report.summary.index_events, produced.captured);
    assert_eq!(report.stats.missing_details, 0);

    let reader = TraceReader::open(out.path()).unwrap();
    assert!(reader.is_clean());
    assert_eq!(reader.events.len() as u64, produced.captured);
    assert!(reader.verify_links().is_consistent());

    let manifest: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.path().join(MANIFEST_FILE_NAME)).unwrap()).unwrap();
    assert_eq!(manifest["session"], "concurrent");
    assert_eq!(manifest["trace"]["index_events"], produced.captured);
    assert_eq!(manifest["registered_threads"], 4);
}

#[test]
fn test_unfinalized_trace_is_recoverable() {
    let shm = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let session = Arc::new(Session::create(config(shm.path(), out.path(), "crash")).unwrap());
    session.start();
    let mut worker = DrainWorker::new(Arc::clone(&session)).unwrap();
    for _ in 0..3 {
        worker.run_pass(clock::now_ns()).unwrap();
    }

    let tracer = Tracer::new(Arc::clone(&session));
    for i in 0..600u32 {
        let kind = if i % 2 == 0 { EventKind::Call } else { EventKind::Return };
        tracer.on_occurrence(ThreadId(9), FunctionId::new(1, i), kind, u64::from(i) + 1, None);
    }
    // Two full rings reach the file; the drain then disappears without finalizing
    worker.run_pass(clock::now_ns()).unwrap();
    drop(worker);

    let reader = TraceReader::open(out.path()).unwrap();
    assert_eq!(reader.status, RecoveryStatus::Recovered);
    assert_eq!(reader.events.len(), 512);
    assert_eq!(reader.events[511].timestamp_ns, 512);
}
