//! Picking the interpreter lock out of every lock seen at the probe site
//!
//! Other locks can block through the same libc call (`sem_wait` on
//! Python 2, `pthread_cond_timedwait` on Python 3). Every blocking
//! operation in the interpreter, including acquiring one of those other
//! locks, also passes through the interpreter lock, so the interpreter
//! lock has the largest call count summed over all threads.
//!
//! Ties are not broken beyond scan order: the winner is the first lock
//! whose running sum reaches a new strict maximum while walking the
//! snapshot. Two locks with identical totals can be misidentified.

use crate::aggregate::Aggregate;
use crate::correlation::LockInstance;
use crate::error::{GilStatsError, Result};
use std::collections::HashMap;

/// Totals for one lock instance summed across threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTotals {
    pub lock: LockInstance,
    pub total_elapsed_ns: u64,
    pub call_count: u64,
}

/// Sum per-lock totals in first-seen order
pub fn lock_totals(aggregates: &[Aggregate]) -> Vec<LockTotals> {
    let mut index: HashMap<LockInstance, usize> = HashMap::new();
    let mut totals: Vec<LockTotals> = Vec::new();

    for row in aggregates {
        let slot = *index.entry(row.lock).or_insert_with(|| {
            totals.push(LockTotals {
                lock: row.lock,
                total_elapsed_ns: 0,
                call_count: 0,
            });
            totals.len() - 1
        });
        totals[slot].total_elapsed_ns += row.total_elapsed_ns;
        totals[slot].call_count += row.call_count;
    }

    totals
}

/// Identify the interpreter lock among the observed lock instances
///
/// Fails with [`GilStatsError::NoCandidate`] when nothing was recorded,
/// which usually means the probed symbol never fired.
pub fn identify_interpreter_lock(aggregates: &[Aggregate]) -> Result<LockInstance> {
    let mut running: HashMap<LockInstance, u64> = HashMap::new();
    let mut max_calls = 0u64;
    let mut candidate = None;

    for row in aggregates {
        let sum = running.entry(row.lock).or_insert(0);
        *sum += row.call_count;
        if *sum > max_calls {
            max_calls = *sum;
            candidate = Some(row.lock);
        }
    }

    for totals in lock_totals(aggregates) {
        tracing::debug!(
            lock = %format!("{:#x}", totals.lock),
            calls = totals.call_count,
            total_ns = totals.total_elapsed_ns,
            "lock candidate"
        );
    }

    candidate.ok_or(GilStatsError::NoCandidate {
        examined: aggregates.len(),
    })
}
