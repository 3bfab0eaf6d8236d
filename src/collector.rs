//! Event collection loop and stop handling
//!
//! Probe events arrive from the backend over a channel. The loop applies
//! them to the entry and aggregate stores until a stop is requested,
//! checking for the request at least once per poll interval.
//!
//! ```text
//! COLLECTING --stop--> STOPPING --> snapshot, identify, report
//! ```
//!
//! The first stop request moves the loop to STOPPING; later requests are
//! swallowed so a second Ctrl+C cannot abort the report.

use crate::aggregate::AggregateStore;
use crate::correlation::{EntryStore, LockInstance, ThreadId};
use crate::error::Result;
use crate::lock_identity::identify_interpreter_lock;
use crate::report::Report;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

/// One probe hit in the monitored process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeEvent {
    Entry {
        thread: ThreadId,
        lock: LockInstance,
        timestamp_ns: u64,
    },
    Exit {
        thread: ThreadId,
        timestamp_ns: u64,
    },
}

/// Apply a single probe event to the stores
pub fn handle_event(entries: &EntryStore, aggregates: &AggregateStore, event: ProbeEvent) {
    match event {
        ProbeEvent::Entry {
            thread,
            lock,
            timestamp_ns,
        } => entries.on_entry(thread, lock, timestamp_ns),
        ProbeEvent::Exit {
            thread,
            timestamp_ns,
        } => {
            if let Some(call) = entries.on_exit(thread, timestamp_ns) {
                aggregates.record(thread, call.lock, call.elapsed_ns);
            }
        }
    }
}

/// Wall-clock start of the observation session
#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    started: SystemTime,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            started: SystemTime::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed().unwrap_or_default()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

static OS_STOP_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_stop_signal(_signum: libc::c_int) {
    if let Some(flag) = OS_STOP_FLAG.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// Events applied between clock reads while draining a busy channel
const CLOCK_CHECK_EVERY: usize = 256;

const STOP_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

/// Cooperative stop request shared between signal handler and loop
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    requested: Arc<AtomicBool>,
    os_handler: bool,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route SIGINT and SIGTERM into this stop signal
    ///
    /// Only one stop signal per process can own the OS handler.
    pub fn install_os_handler(&mut self) -> Result<()> {
        if OS_STOP_FLAG.set(Arc::clone(&self.requested)).is_err() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "stop signal handler already installed",
            )
            .into());
        }

        let action = SigAction::new(
            SigHandler::Handler(on_stop_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for sig in STOP_SIGNALS {
            // SAFETY: the handler only stores to an atomic.
            unsafe { signal::sigaction(sig, &action) }.map_err(std::io::Error::from)?;
        }
        self.os_handler = true;
        Ok(())
    }

    /// Request a stop. Returns `true` only for the first request.
    pub fn request(&self) -> bool {
        !self.requested.swap(true, Ordering::SeqCst)
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Ignore further stop signals for the rest of the run
    fn suppress(&self) {
        if !self.os_handler {
            return;
        }
        for sig in STOP_SIGNALS {
            // SAFETY: SIG_IGN installs no handler code.
            if let Err(e) = unsafe { signal::signal(sig, SigHandler::SigIgn) } {
                tracing::warn!("failed to ignore {}: {}", sig, e);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Collecting,
    Stopping,
}

/// Loop counters, reported at debug level on shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionStats {
    pub events: u64,
    pub polls: u64,
}

/// Collection loop over a probe event channel
pub struct CollectionLoop<'a> {
    entries: &'a EntryStore,
    aggregates: &'a AggregateStore,
    events: Receiver<ProbeEvent>,
    stop: StopSignal,
    poll_interval: Duration,
    deadline: Option<Instant>,
    state: LoopState,
}

impl<'a> CollectionLoop<'a> {
    pub fn new(
        entries: &'a EntryStore,
        aggregates: &'a AggregateStore,
        events: Receiver<ProbeEvent>,
        stop: StopSignal,
        poll_interval: Duration,
    ) -> Self {
        Self {
            entries,
            aggregates,
            events,
            stop,
            poll_interval,
            deadline: None,
            state: LoopState::Collecting,
        }
    }

    /// Issue a stop request on our own after `duration`
    pub fn with_duration(mut self, duration: Option<Duration>) -> Self {
        self.deadline = duration.map(|d| Instant::now() + d);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Collect until a stop request, then enter STOPPING
    pub fn run(&mut self) -> CollectionStats {
        let mut stats = CollectionStats::default();
        let mut backend_gone = false;

        while self.state == LoopState::Collecting {
            stats.polls += 1;

            if backend_gone {
                std::thread::sleep(self.poll_interval);
            } else {
                let poll_end = Instant::now() + self.poll_interval;
                match self.events.recv_timeout(self.poll_interval) {
                    Ok(event) => {
                        handle_event(self.entries, self.aggregates, event);
                        stats.events += 1;
                        // A busy source must not starve the stop check below
                        for (i, event) in self.events.try_iter().enumerate() {
                            handle_event(self.entries, self.aggregates, event);
                            stats.events += 1;
                            if i % CLOCK_CHECK_EVERY == 0 && Instant::now() >= poll_end {
                                break;
                            }
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        tracing::warn!("probe event source closed, waiting for stop request");
                        backend_gone = true;
                    }
                }
            }

            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                self.stop.request();
            }
            if self.stop.is_requested() {
                self.stop.suppress();
                self.state = LoopState::Stopping;
            }
        }

        tracing::debug!(events = stats.events, polls = stats.polls, "collection stopped");
        stats
    }

    /// Apply events the backend queued before it was detached
    pub fn drain(&mut self) -> u64 {
        let mut drained = 0;
        for event in self.events.try_iter() {
            handle_event(self.entries, self.aggregates, event);
            drained += 1;
        }
        drained
    }
}

/// Snapshot the aggregates, identify the interpreter lock, build the report
pub fn shutdown_report(aggregates: &AggregateStore, run: &RunContext) -> Result<Report> {
    let rows = aggregates.snapshot();
    let lock = identify_interpreter_lock(&rows)?;
    tracing::debug!(lock = %format!("{:#x}", lock), "interpreter lock identified");
    Ok(Report::build(&rows, lock, run.elapsed()))
}
