//! Per-thread, per-lock contention totals
//!
//! Each (thread, lock) key owns a pair of atomic counters. The map is
//! sharded, and once a key exists updates go through a shared read guard
//! plus `fetch_add`, so producers on different threads never serialize
//! on one global lock.

use crate::correlation::{LockInstance, ThreadId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct AggregateCell {
    total_ns: AtomicU64,
    calls: AtomicU64,
}

impl AggregateCell {
    fn add(&self, elapsed_ns: u64) {
        self.total_ns.fetch_add(elapsed_ns, Ordering::Relaxed);
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time totals for one (thread, lock) key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregate {
    pub thread: ThreadId,
    pub lock: LockInstance,
    /// Sum of blocked time in nanoseconds
    pub total_elapsed_ns: u64,
    pub call_count: u64,
}

#[derive(Debug, Default)]
pub struct AggregateStore {
    cells: DashMap<(ThreadId, LockInstance), AggregateCell>,
}

impl AggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one matched call into the (thread, lock) totals
    pub fn record(&self, thread: ThreadId, lock: LockInstance, elapsed_ns: u64) {
        let key = (thread, lock);
        if let Some(cell) = self.cells.get(&key) {
            cell.add(elapsed_ns);
            return;
        }
        self.cells.entry(key).or_default().add(elapsed_ns);
    }

    /// Copy out every aggregate, ordered by thread then lock
    ///
    /// Callers should stop event delivery first; rows updated during the
    /// copy reflect either the old or the new totals.
    pub fn snapshot(&self) -> Vec<Aggregate> {
        let mut rows: Vec<Aggregate> = self
            .cells
            .iter()
            .map(|entry| {
                let (thread, lock) = *entry.key();
                Aggregate {
                    thread,
                    lock,
                    total_elapsed_ns: entry.value().total_ns.load(Ordering::Relaxed),
                    call_count: entry.value().calls.load(Ordering::Relaxed),
                }
            })
            .collect();
        rows.sort_unstable_by_key(|row| (row.thread, row.lock));
        rows
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
