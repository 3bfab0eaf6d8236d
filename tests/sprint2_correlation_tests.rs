//! Sprint 2: entry/exit pairing and per-(thread, lock) aggregation

use gilstats::aggregate::AggregateStore;
use gilstats::collector::{handle_event, ProbeEvent};
use gilstats::correlation::EntryStore;

fn entry(thread: u32, lock: u64, timestamp_ns: u64) -> ProbeEvent {
    ProbeEvent::Entry {
        thread,
        lock,
        timestamp_ns,
    }
}

fn exit(thread: u32, timestamp_ns: u64) -> ProbeEvent {
    ProbeEvent::Exit {
        thread,
        timestamp_ns,
    }
}

fn replay(events: &[ProbeEvent]) -> AggregateStore {
    let entries = EntryStore::new();
    let aggregates = AggregateStore::new();
    for event in events {
        handle_event(&entries, &aggregates, *event);
    }
    aggregates
}

#[test]
fn test_matched_pair_adds_one_call_and_elapsed() {
    let aggregates = replay(&[entry(10, 0xa, 1_000), exit(10, 6_000)]);
    let rows = aggregates.snapshot();

    assert_eq!(rows.len(), 1);
    assert_eq!((rows[0].thread, rows[0].lock), (10, 0xa));
    assert_eq!(rows[0].call_count, 1);
    assert_eq!(rows[0].total_elapsed_ns, 5_000);
}

#[test]
fn test_exit_without_entry_changes_nothing() {
    let aggregates = replay(&[exit(10, 6_000)]);
    assert!(aggregates.is_empty());
}

#[test]
fn test_exit_without_entry_leaves_other_aggregates_alone() {
    let aggregates = replay(&[entry(1, 0xa, 0), exit(1, 10), exit(2, 50)]);
    let rows = aggregates.snapshot();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].call_count, 1);
    assert_eq!(rows[0].total_elapsed_ns, 10);
}

#[test]
fn test_reentry_attributes_to_latest_lock() {
    let aggregates = replay(&[entry(3, 0x1, 100), entry(3, 0x2, 200), exit(3, 350)]);
    let rows = aggregates.snapshot();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].lock, 0x2);
    assert_eq!(rows[0].total_elapsed_ns, 150);
}

#[test]
fn test_interleaved_threads() {
    let aggregates = replay(&[
        entry(1, 0xa, 0),
        entry(2, 0xa, 5),
        exit(2, 25),
        entry(2, 0xb, 30),
        exit(1, 100),
        exit(2, 31),
    ]);
    let rows = aggregates.snapshot();

    assert_eq!(rows.len(), 3);
    assert_eq!((rows[0].thread, rows[0].lock, rows[0].total_elapsed_ns), (1, 0xa, 100));
    assert_eq!((rows[1].thread, rows[1].lock, rows[1].total_elapsed_ns), (2, 0xa, 20));
    assert_eq!((rows[2].thread, rows[2].lock, rows[2].total_elapsed_ns), (2, 0xb, 1));
}

#[test]
fn test_long_block_is_valid_data() {
    let hour_ns = 3_600 * 1_000_000_000u64;
    let aggregates = replay(&[entry(1, 0xa, 0), exit(1, hour_ns)]);
    assert_eq!(aggregates.snapshot()[0].total_elapsed_ns, hour_ns);
}

#[test]
fn test_concurrent_producers_per_thread() {
    use std::sync::Arc;

    let entries = Arc::new(EntryStore::new());
    let aggregates = Arc::new(AggregateStore::new());
    let producers: Vec<_> = (0..8u32)
        .map(|tid| {
            let entries = Arc::clone(&entries);
            let aggregates = Arc::clone(&aggregates);
            std::thread::spawn(move || {
                for i in 0..500u64 {
                    handle_event(&entries, &aggregates, entry(tid, 0xa, i * 10));
                    handle_event(&entries, &aggregates, exit(tid, i * 10 + 3));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let rows = aggregates.snapshot();
    assert_eq!(rows.len(), 8);
    for row in rows {
        assert_eq!(row.call_count, 500);
        assert_eq!(row.total_elapsed_ns, 1_500);
    }
}
