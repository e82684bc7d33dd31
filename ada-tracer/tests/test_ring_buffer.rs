use ada_tracer::ring::{ring_bytes, RingBuffer};
use ada_tracer::shm::ShmSegment;
use ada_tracer_common::IndexEvent;
use proptest::prelude::*;
use std::collections::VecDeque;

fn segment(capacity: u32, element_size: u32) -> ShmSegment {
    ShmSegment::anonymous("/ring-it", ring_bytes(capacity, element_size)).expect("Failed to map ring segment")
}

proptest! {
    #[test]
    fn test_interleaved_ops_match_fifo_model(
        capacity_log in 0u32..7,
        ops in prop::collection::vec(any::<bool>(), 1..512),
    ) {
        let capacity = 1u32 << capacity_log;
        let seg = segment(capacity, 8);
        let ring = RingBuffer::create(seg.region(0, seg.len()).unwrap(), capacity, 8).unwrap();
        let mut model: VecDeque<u64> = VecDeque::new();
        let mut next = 0u64;
        let mut rejected = 0u64;

        for write in ops {
            if write {
                let accepted = ring.write(&next.to_le_bytes());
                prop_assert_eq!(accepted, model.len() < capacity as usize);
                if accepted {
                    model.push_back(next);
                } else {
                    rejected += 1;
                }
                next += 1;
            } else {
                let mut out = [0u8; 8];
                let got = ring.read(&mut out);
                prop_assert_eq!(got, !model.is_empty());
                if got {
                    prop_assert_eq!(Some(u64::from_le_bytes(out)), model.pop_front());
                }
            }
            prop_assert_eq!(ring.available_read(), model.len() as u64);
            prop_assert_eq!(ring.available_read() + ring.available_write(), u64::from(capacity));
        }
        prop_assert_eq!(ring.overflow_count(), rejected);
    }

    #[test]
    fn test_overflow_never_overwrites(capacity_log in 0u32..6, extra in 0u32..64) {
        let capacity = 1u32 << capacity_log;
        let seg = segment(capacity, 32);
        let ring = RingBuffer::create(seg.region(0, seg.len()).unwrap(), capacity, 32).unwrap();

        let written = (0..capacity + extra)
            .filter(|&i| ring.write_record(&IndexEvent { timestamp_ns: u64::from(i), ..IndexEvent::default() }))
            .count();
        prop_assert_eq!(written, capacity as usize);
        prop_assert_eq!(ring.overflow_count(), u64::from(extra));

        let mut drained = Vec::new();
        ring.drain_records::<IndexEvent>(&mut drained, usize::MAX);
        let stamps: Vec<u64> = drained.iter().map(|e| e.timestamp_ns).collect();
        let expected: Vec<u64> = (0..u64::from(capacity)).collect();
        prop_assert_eq!(stamps, expected);
    }
}

#[test]
fn test_concurrent_producer_consumer_preserve_order() {
    const TOTAL: u64 = 100_000;
    let seg = segment(64, 8);
    RingBuffer::create(seg.region(0, seg.len()).unwrap(), 64, 8).unwrap();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            let ring = RingBuffer::attach(seg.region(0, seg.len()).unwrap(), 8).unwrap();
            let mut next = 0u64;
            while next < TOTAL {
                if ring.write(&next.to_le_bytes()) {
                    next += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
        });

        let ring = RingBuffer::attach(seg.region(0, seg.len()).unwrap(), 8).unwrap();
        let mut expected = 0u64;
        let mut out = [0u8; 8];
        while expected < TOTAL {
            if ring.read(&mut out) {
                assert_eq!(u64::from_le_bytes(out), expected);
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
    });
}

#[test]
fn test_second_mapping_sees_same_ring() {
    let dir = tempfile::tempdir().unwrap();
    let size = ring_bytes(16, 32);
    let producer_seg = ShmSegment::create(dir.path(), "/ring-shared", size).unwrap();
    let consumer_seg = ShmSegment::open(dir.path(), "/ring-shared").unwrap();

    let producer = RingBuffer::create(producer_seg.region(0, size).unwrap(), 16, 32).unwrap();
    let consumer = RingBuffer::attach(consumer_seg.region(0, size).unwrap(), 32).unwrap();

    for ts in 0..5 {
        assert!(producer.write_record(&IndexEvent { timestamp_ns: ts, ..IndexEvent::default() }));
    }
    assert_eq!(consumer.available_read(), 5);
    assert_eq!(consumer.read_record::<IndexEvent>().unwrap().timestamp_ns, 0);
    assert_eq!(producer.available_read(), 4);
}
