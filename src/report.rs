//! Final per-thread report for the interpreter lock

use crate::aggregate::Aggregate;
use crate::correlation::{LockInstance, ThreadId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Wait totals of one thread on the interpreter lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadReport {
    pub thread: ThreadId,
    pub total_elapsed_in_seconds: f64,
    pub call_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    /// Lock instance the report was filtered on
    pub lock: LockInstance,
    /// One entry per thread that waited on `lock`, ordered by thread id
    pub threads: Vec<ThreadReport>,
    /// Wall-clock length of the observation session
    pub session_elapsed: Duration,
}

impl Report {
    /// Keep only the rows for `lock` and convert them to seconds
    pub fn build(aggregates: &[Aggregate], lock: LockInstance, session_elapsed: Duration) -> Self {
        let mut threads: Vec<ThreadReport> = aggregates
            .iter()
            .filter(|row| row.lock == lock)
            .map(|row| ThreadReport {
                thread: row.thread,
                total_elapsed_in_seconds: nanos_to_secs(row.total_elapsed_ns),
                call_count: row.call_count,
            })
            .collect();
        threads.sort_by_key(|t| t.thread);

        Self {
            lock,
            threads,
            session_elapsed,
        }
    }

    pub fn threads_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.threads)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = self.threads_json().map_err(|_| fmt::Error)?;
        writeln!(f)?;
        writeln!(f, "*** Per-thread Results")?;
        writeln!(f, "{}", json)?;
        writeln!(f)?;
        write!(
            f,
            "*** Total elapsed: {} secs",
            self.session_elapsed.as_secs_f64()
        )
    }
}

pub fn nanos_to_secs(nanos: u64) -> f64 {
    nanos as f64 / NANOS_PER_SEC
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(thread: u32, lock: u64, total_elapsed_ns: u64, call_count: u64) -> Aggregate {
        Aggregate {
            thread,
            lock,
            total_elapsed_ns,
            call_count,
        }
    }

    #[test]
    fn test_nanos_convert_to_fractional_seconds() {
        assert_eq!(nanos_to_secs(2_500_000_000), 2.5);
        assert_eq!(nanos_to_secs(0), 0.0);
    }

    #[test]
    fn test_build_filters_on_lock() {
        let rows = vec![
            row(1, 0xa, 1_000_000_000, 5),
            row(1, 0xb, 3_000, 3),
            row(2, 0xa, 500_000_000, 7),
        ];
        let report = Report::build(&rows, 0xa, Duration::from_secs(3));

        assert_eq!(report.threads.len(), 2);
        assert_eq!(report.threads[0].thread, 1);
        assert_eq!(report.threads[0].call_count, 5);
        assert_eq!(report.threads[0].total_elapsed_in_seconds, 1.0);
        assert_eq!(report.threads[1].thread, 2);
        assert_eq!(report.threads[1].total_elapsed_in_seconds, 0.5);
    }

    #[test]
    fn test_json_field_names() {
        let rows = vec![row(42, 0xa, 2_500_000_000, 9)];
        let report = Report::build(&rows, 0xa, Duration::ZERO);
        let value: serde_json::Value =
            serde_json::from_str(&report.threads_json().unwrap()).unwrap();

        assert_eq!(value[0]["thread"], 42);
        assert_eq!(value[0]["total_elapsed_in_seconds"], 2.5);
        assert_eq!(value[0]["call_count"], 9);
    }

    #[test]
    fn test_display_layout() {
        let rows = vec![row(1, 0xa, 10, 1)];
        let report = Report::build(&rows, 0xa, Duration::from_millis(1500));
        let text = report.to_string();

        assert!(text.contains("*** Per-thread Results"));
        assert!(text.ends_with("*** Total elapsed: 1.5 secs"));
    }
}
