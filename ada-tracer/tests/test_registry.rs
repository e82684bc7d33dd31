use ada_tracer::config::{BackpressureConfig, RegistryConfig};
use ada_tracer::domain::{SessionId, ThreadId};
use ada_tracer::registry::{LaneKind, ThreadRegistry};
use ada_tracer::shm::ShmSegment;
use ada_tracer_common::IndexEvent;
use std::collections::HashSet;
use std::path::Path;

fn config(max_threads: u32) -> RegistryConfig {
    RegistryConfig {
        max_threads,
        index_rings: 4,
        index_ring_capacity: 64,
        detail_rings: 2,
        detail_ring_capacity: 8,
        global_ring_capacity: 64,
    }
}

fn create(root: &Path, name: &str, config: &RegistryConfig) -> ThreadRegistry {
    let seg = ShmSegment::create(root, name, ThreadRegistry::required_size(config)).expect("Failed to create segment");
    ThreadRegistry::create(seg, config, &BackpressureConfig::default(), SessionId(0xfeed)).expect("Failed to init")
}

#[test]
fn test_concurrent_registration_fills_registry_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let registry = create(dir.path(), "/reg-concurrent", &config(64));

    let slots: Vec<u32> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..64u32)
            .map(|i| {
                let registry = &registry;
                scope.spawn(move || registry.register(ThreadId(10_000 + i)).map(|slot| slot.index().0))
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap().expect("registration failed")).collect()
    });

    let unique: HashSet<u32> = slots.iter().copied().collect();
    assert_eq!(unique.len(), 64);
    assert!(unique.iter().all(|&s| s < 64));
    assert_eq!(registry.registered_count(), 64);
    assert_eq!(registry.active_count(), 64);

    assert!(registry.register(ThreadId(99_999)).is_none());
    assert_eq!(registry.registration_failures(), 1);
    assert!(registry.dump().out_of_range().is_empty());
}

#[test]
fn test_second_mapping_sees_registrations_and_events() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(4);
    let owner = create(dir.path(), "/reg-shared", &config);
    let slot = owner.register(ThreadId(77)).unwrap();
    assert!(slot.index_lane().active_ring().unwrap().write_record(&IndexEvent {
        timestamp_ns: 42,
        thread_id: 77,
        ..IndexEvent::default()
    }));

    // A separate mapping lands at a different base address; offsets still resolve
    let peer = ThreadRegistry::attach(ShmSegment::open(dir.path(), "/reg-shared").unwrap()).unwrap();
    assert_ne!(owner.segment().base_addr(), peer.segment().base_addr());
    assert_eq!(peer.session_id(), SessionId(0xfeed));
    assert_eq!(peer.registered_count(), 1);

    let seen = peer.lookup(ThreadId(77)).expect("peer should see the registration");
    assert_eq!(seen.index(), slot.index());
    let event = seen.lane(LaneKind::Index).active_ring().unwrap().read_record::<IndexEvent>().unwrap();
    assert_eq!(event.timestamp_ns, 42);
    assert!(owner.slot(slot.index()).unwrap().index_lane().active_ring().unwrap().is_empty());

    assert_eq!(owner.dump().entries, peer.dump().entries);
}

#[test]
fn test_attach_rejects_truncated_segment() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(2);
    let _owner = create(dir.path(), "/reg-trunc", &config);

    let path = dir.path().join("reg-trunc");
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(ThreadRegistry::required_size(&config) / 2).unwrap();
    drop(file);

    assert!(ThreadRegistry::attach(ShmSegment::open(dir.path(), "/reg-trunc").unwrap()).is_err());
}

#[test]
fn test_unregistered_thread_gets_a_fresh_slot() {
    let dir = tempfile::tempdir().unwrap();
    let registry = create(dir.path(), "/reg-fresh", &config(3));
    let first = registry.register(ThreadId(1)).unwrap().index();
    assert_eq!(registry.register(ThreadId(1)).unwrap().index(), first);

    assert!(registry.unregister(first));
    let second = registry.register(ThreadId(1)).unwrap().index();
    assert_ne!(first, second);
    assert_eq!(registry.active_count(), 1);
    assert_eq!(registry.registered_count(), 2);
}
