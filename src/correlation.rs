//! Entry/exit correlation per observed thread
//!
//! The return probe cannot see the arguments the entry probe saw, so the
//! lock instance travels from entry to exit through an [`EntryRecord`]
//! keyed by thread id. A thread is inside at most one instrumented call
//! at a time, so one slot per thread is enough.

use dashmap::DashMap;

/// Kernel thread id of the observed thread
pub type ThreadId = u32;

/// Address of the lock object passed to the instrumented call
pub type LockInstance = u64;

/// State saved at call entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRecord {
    /// Monotonic timestamp of the entry event (nanoseconds)
    pub start_ns: u64,
    /// Lock instance seen in the first call argument
    pub lock: LockInstance,
}

/// A matched entry/exit pair, ready for aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchedCall {
    pub lock: LockInstance,
    pub elapsed_ns: u64,
}

/// One entry slot per thread, sharded so concurrent producers on
/// different threads never contend on a single lock
#[derive(Debug, Default)]
pub struct EntryStore {
    slots: DashMap<ThreadId, EntryRecord>,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call entry, replacing any record left by a missed exit
    pub fn on_entry(&self, thread: ThreadId, lock: LockInstance, timestamp_ns: u64) {
        let previous = self.slots.insert(
            thread,
            EntryRecord {
                start_ns: timestamp_ns,
                lock,
            },
        );
        if let Some(stale) = previous {
            tracing::trace!(
                thread,
                stale_lock = %format!("{:#x}", stale.lock),
                "entry overwrote an unmatched entry record"
            );
        }
    }

    /// Match a call exit against the thread's entry record
    ///
    /// Returns `None` when the thread has no entry record, e.g. when the
    /// probes were attached while the call was already in progress. The
    /// record is consumed so a duplicated exit cannot be counted twice.
    pub fn on_exit(&self, thread: ThreadId, timestamp_ns: u64) -> Option<MatchedCall> {
        let Some((_, record)) = self.slots.remove(&thread) else {
            tracing::trace!(thread, "exit without entry record dropped");
            return None;
        };

        Some(MatchedCall {
            lock: record.lock,
            elapsed_ns: timestamp_ns.saturating_sub(record.start_ns),
        })
    }

    /// Current entry record for a thread
    pub fn get(&self, thread: ThreadId) -> Option<EntryRecord> {
        self.slots.get(&thread).map(|r| *r)
    }

    /// Number of threads currently inside the instrumented call
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
