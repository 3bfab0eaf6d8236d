//! Attach to a running interpreter and measure interpreter lock waits
//!
//! Resolution and attach failures abort before any data is collected.
//! Once probes are live, the run only ends through a stop request.

use crate::aggregate::AggregateStore;
use crate::collector::{shutdown_report, CollectionLoop, RunContext, StopSignal};
use crate::correlation::EntryStore;
use crate::error::{GilStatsError, Result};
use crate::report::Report;
use crate::runtime::{resolve_target, ProbeTarget};
use crate::symbols::resolve_symbol_sites;
use crate::uprobe::{TraceFs, UprobeSession};
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;

/// Settings for one tracing run
#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub pid: i32,
    /// Library override (otherwise found in the target's mappings)
    pub library: Option<PathBuf>,
    /// Symbol regex override (otherwise chosen by Python major version)
    pub symbol: Option<String>,
    pub tracefs: Option<PathBuf>,
    pub poll_interval: Duration,
    /// Stop on our own after this long
    pub duration: Option<Duration>,
}

impl TracerConfig {
    pub fn new(pid: i32) -> Self {
        Self {
            pid,
            library: None,
            symbol: None,
            tracefs: None,
            poll_interval: Duration::from_millis(100),
            duration: None,
        }
    }
}

/// Resolve the probe site, attach, collect until stopped, and build the report
///
/// `on_attached` runs once probes are live (the binary prints its status
/// line there).
pub fn attach_to_pid(
    config: &TracerConfig,
    mut stop: StopSignal,
    on_attached: impl FnOnce(&ProbeTarget),
) -> Result<Report> {
    let run = RunContext::new();

    let target = resolve_target(config.pid, config.library.as_deref(), config.symbol.as_deref())?;
    let pattern = Regex::new(&target.symbol_pattern).map_err(|e| GilStatsError::Attach {
        detail: format!("invalid symbol pattern {}: {}", target.symbol_pattern, e),
    })?;
    let sites = resolve_symbol_sites(&target.library, &pattern)?;
    for site in &sites {
        tracing::debug!(
            "probe site {} at {:#x} (file offset {:#x})",
            site.name,
            site.address,
            site.file_offset
        );
    }

    let tracefs = TraceFs::locate(config.tracefs.as_deref())?;
    stop.install_os_handler()?;

    let (tx, rx) = crossbeam::channel::unbounded();
    let session = UprobeSession::attach(tracefs, &target, &sites, tx)?;
    on_attached(&target);

    let entries = EntryStore::new();
    let aggregates = AggregateStore::new();
    let mut collection = CollectionLoop::new(&entries, &aggregates, rx, stop, config.poll_interval)
        .with_duration(config.duration);
    collection.run();

    if let Err(e) = session.detach() {
        tracing::warn!("probe detach incomplete: {}", e);
    }
    let late = collection.drain();
    tracing::debug!(late, "applied events queued before detach");

    shutdown_report(&aggregates, &run)
}
