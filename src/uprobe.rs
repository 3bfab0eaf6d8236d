//! Linux uprobe backend on top of tracefs
//!
//! Probes are registered as dynamic events in `uprobe_events`, one entry
//! probe (capturing the lock pointer from the first argument) and one
//! return probe per symbol site. Events are enabled in a private tracefs
//! instance that uses the monotonic clock and is limited to the target's
//! threads, so other processes mapping the same library are not traced.
//!
//! A reader thread drains the instance's `trace_pipe`, which the kernel
//! merges across CPUs in timestamp order, and forwards parsed events to
//! the collection loop.

use crate::collector::ProbeEvent;
use crate::error::{GilStatsError, Result};
use crate::runtime::ProbeTarget;
use crate::symbols::SymbolSite;
use crossbeam::channel::Sender;
use regex::Regex;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const TRACEFS_MOUNTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

const ENTRY_EVENT: &str = "lock_enter";
const EXIT_EVENT: &str = "lock_exit";

const READER_IDLE: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 64 * 1024;

#[cfg(target_arch = "x86_64")]
const FIRST_ARG: &str = "%di";
#[cfg(target_arch = "aarch64")]
const FIRST_ARG: &str = "%x0";
#[cfg(target_arch = "riscv64")]
const FIRST_ARG: &str = "%a0";
#[cfg(target_arch = "arm")]
const FIRST_ARG: &str = "%r0";
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "riscv64",
    target_arch = "arm"
)))]
compile_error!("no uprobe fetch argument known for this architecture");

/// A mounted tracefs
#[derive(Debug, Clone)]
pub struct TraceFs {
    root: PathBuf,
}

impl TraceFs {
    /// Use `root` if given, otherwise the first standard mount with uprobe support
    pub fn locate(root: Option<&Path>) -> Result<Self> {
        let candidates: Vec<PathBuf> = match root {
            Some(root) => vec![root.to_path_buf()],
            None => TRACEFS_MOUNTS.iter().map(PathBuf::from).collect(),
        };

        candidates
            .iter()
            .find(|dir| dir.join("uprobe_events").exists())
            .map(|dir| Self { root: dir.clone() })
            .ok_or_else(|| GilStatsError::TraceFsUnavailable {
                tried: candidates
                    .iter()
                    .map(|d| d.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write(&self, rel: impl AsRef<Path>, contents: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.root.join(rel))?;
        file.write_all(contents.as_bytes())
    }

    /// Append to a control file; truncating `uprobe_events` would drop every probe
    fn append(&self, rel: impl AsRef<Path>, line: &str) -> io::Result<()> {
        let mut file = OpenOptions::new().append(true).open(self.root.join(rel))?;
        file.write_all(format!("{}\n", line).as_bytes())
    }
}

/// `p:` definition capturing the lock pointer
pub fn entry_probe_definition(group: &str, index: usize, library: &Path, offset: u64) -> String {
    format!(
        "p:{}/{}_{} {}:{:#x} lock={}:x64",
        group,
        ENTRY_EVENT,
        index,
        library.display(),
        offset,
        FIRST_ARG
    )
}

/// `r:` definition for the matching return
pub fn return_probe_definition(group: &str, index: usize, library: &Path, offset: u64) -> String {
    format!(
        "r:{}/{}_{} {}:{:#x}",
        group,
        EXIT_EVENT,
        index,
        library.display(),
        offset
    )
}

/// Event group name used for a target PID
pub fn probe_group(pid: i32) -> String {
    format!("gilstats_{}", pid)
}

fn trace_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // <comm>-<tid> [(<tgid>)] [<cpu>] [<flags>] <secs>.<frac>: <event>_<n>: <fields>
        Regex::new(
            r"^\s*.+-(?P<tid>\d+)\s+(?:\(\s*[\d-]+\)\s+)?\[\d+\]\s+(?:\S+\s+)?(?P<ts>\d+\.\d+):\s+(?P<event>lock_enter|lock_exit)_\d+:(?P<rest>.*)$",
        )
        .expect("trace line regex is valid")
    })
}

/// Convert a `secs.fraction` trace timestamp to nanoseconds
pub fn parse_timestamp_ns(ts: &str) -> Option<u64> {
    let (secs, frac) = ts.split_once('.')?;
    let secs: u64 = secs.parse().ok()?;
    if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let frac_ns: u64 = format!("{:0<9}", frac).parse().ok()?;
    secs.checked_mul(1_000_000_000)?.checked_add(frac_ns)
}

fn parse_lock_field(rest: &str) -> Option<u64> {
    let value = rest
        .split_whitespace()
        .find_map(|field| field.strip_prefix("lock="))?;
    match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Parse one `trace_pipe` line into a probe event
///
/// Returns `None` for comments, lost-event markers, foreign events and
/// malformed lines.
pub fn parse_trace_line(line: &str) -> Option<ProbeEvent> {
    let caps = trace_line_regex().captures(line)?;
    let thread = caps["tid"].parse().ok()?;
    let timestamp_ns = parse_timestamp_ns(&caps["ts"])?;

    match &caps["event"] {
        ENTRY_EVENT => Some(ProbeEvent::Entry {
            thread,
            lock: parse_lock_field(&caps["rest"])?,
            timestamp_ns,
        }),
        EXIT_EVENT => Some(ProbeEvent::Exit {
            thread,
            timestamp_ns,
        }),
        _ => None,
    }
}

/// Thread ids currently belonging to `pid`
pub fn thread_ids(pid: i32) -> io::Result<Vec<u32>> {
    let mut tids: Vec<u32> = fs::read_dir(format!("/proc/{}/task", pid))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(|s| s.parse().ok()))
        .collect();
    tids.sort_unstable();
    Ok(tids)
}

/// Probes attached to one target process
///
/// Dropping the session detaches everything that was registered.
pub struct UprobeSession {
    tracefs: TraceFs,
    group: String,
    instance: PathBuf,
    instance_created: bool,
    events_enabled: bool,
    probes: Vec<String>,
    shutdown: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl UprobeSession {
    /// Register and enable entry/return probes on every site, then start
    /// forwarding events into `events`
    pub fn attach(
        tracefs: TraceFs,
        target: &ProbeTarget,
        sites: &[SymbolSite],
        events: Sender<ProbeEvent>,
    ) -> Result<Self> {
        let library = target.library.to_string_lossy();
        if library.contains(char::is_whitespace) {
            return Err(GilStatsError::Attach {
                detail: format!("library path {} contains whitespace", library),
            });
        }

        let group = probe_group(target.pid);
        let mut session = Self {
            instance: PathBuf::from("instances").join(&group),
            tracefs,
            group,
            instance_created: false,
            events_enabled: false,
            probes: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            reader: None,
        };

        session.remove_stale();
        for (index, site) in sites.iter().enumerate() {
            let defs = [
                (
                    format!("{}_{}", ENTRY_EVENT, index),
                    entry_probe_definition(&session.group, index, &target.library, site.file_offset),
                ),
                (
                    format!("{}_{}", EXIT_EVENT, index),
                    return_probe_definition(&session.group, index, &target.library, site.file_offset),
                ),
            ];
            for (name, def) in defs {
                tracing::debug!("registering {}", def);
                session
                    .tracefs
                    .append("uprobe_events", &def)
                    .map_err(|e| attach_err(&format!("register {} ({})", name, site.name), e))?;
                session.probes.push(name);
            }
        }

        fs::create_dir(session.tracefs.root().join(&session.instance))
            .map_err(|e| attach_err("create trace instance", e))?;
        session.instance_created = true;

        session
            .tracefs
            .write(session.instance.join("trace_clock"), "mono")
            .map_err(|e| attach_err("select monotonic trace clock", e))?;
        session
            .tracefs
            .write(session.instance.join("options/event-fork"), "1")
            .map_err(|e| attach_err("enable event-fork", e))?;

        let tids = thread_ids(target.pid).map_err(|e| attach_err("list target threads", e))?;
        let pid_filter = tids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        session
            .tracefs
            .write(session.instance.join("set_event_pid"), &pid_filter)
            .map_err(|e| attach_err("scope events to target", e))?;

        session
            .tracefs
            .write(session.group_enable_path(), "1")
            .map_err(|e| attach_err("enable probe events", e))?;
        session.events_enabled = true;

        let pipe = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(session.tracefs.root().join(session.instance.join("trace_pipe")))
            .map_err(|e| attach_err("open trace_pipe", e))?;
        let shutdown = Arc::clone(&session.shutdown);
        session.reader = Some(thread::spawn(move || read_trace_pipe(pipe, events, shutdown)));

        tracing::info!(
            "attached {} probe pairs for PID {} ({} threads)",
            sites.len(),
            target.pid,
            tids.len()
        );
        Ok(session)
    }

    /// Stop the reader and remove every probe
    pub fn detach(mut self) -> Result<()> {
        self.teardown()
    }

    fn group_enable_path(&self) -> PathBuf {
        self.instance.join("events").join(&self.group).join("enable")
    }

    /// Clean up after a previous run on the same PID that did not exit cleanly
    fn remove_stale(&self) {
        let instance = self.tracefs.root().join(&self.instance);
        if let Err(e) = fs::remove_dir(&instance) {
            if e.kind() != ErrorKind::NotFound {
                tracing::debug!("could not remove stale instance {}: {}", instance.display(), e);
            }
        }
        let events = self.tracefs.root().join("events").join(&self.group);
        let Ok(entries) = fs::read_dir(events) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            if entry.path().is_dir() {
                let name = entry.file_name().to_string_lossy().into_owned();
                tracing::debug!("removing stale probe {}/{}", self.group, name);
                if let Err(e) = self
                    .tracefs
                    .append("uprobe_events", &format!("-:{}/{}", self.group, name))
                {
                    tracing::debug!("could not remove stale probe {}/{}: {}", self.group, name, e);
                }
            }
        }
    }

    fn teardown(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                tracing::warn!("trace reader thread panicked");
            }
        }

        let mut first_err: Option<io::Error> = None;
        let mut note = |what: &str, result: io::Result<()>| {
            if let Err(e) = result {
                tracing::warn!("failed to {}: {}", what, e);
                first_err.get_or_insert(e);
            }
        };

        if self.events_enabled {
            note(
                "disable probe events",
                self.tracefs.write(self.group_enable_path(), "0"),
            );
            self.events_enabled = false;
        }
        if self.instance_created {
            note(
                "remove trace instance",
                fs::remove_dir(self.tracefs.root().join(&self.instance)),
            );
            self.instance_created = false;
        }
        for name in self.probes.drain(..) {
            note(
                "remove probe",
                self.tracefs
                    .append("uprobe_events", &format!("-:{}/{}", self.group, name)),
            );
        }

        match first_err {
            Some(e) => Err(e.into()),
            None => {
                tracing::debug!("probes for group {} removed", self.group);
                Ok(())
            }
        }
    }
}

impl Drop for UprobeSession {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

fn attach_err(what: &str, e: io::Error) -> GilStatsError {
    GilStatsError::Attach {
        detail: format!("{}: {}", what, e),
    }
}

/// Forward complete lines from a non-blocking `trace_pipe` until shutdown
fn read_trace_pipe(mut pipe: fs::File, events: Sender<ProbeEvent>, shutdown: Arc<AtomicBool>) {
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut pending: Vec<u8> = Vec::new();

    while !shutdown.load(Ordering::SeqCst) {
        let n = match pipe.read(&mut chunk) {
            Ok(0) => {
                thread::sleep(READER_IDLE);
                continue;
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                thread::sleep(READER_IDLE);
                continue;
            }
            Err(e) => {
                tracing::warn!("trace_pipe read failed: {}", e);
                return;
            }
        };

        pending.extend_from_slice(&chunk[..n]);
        let Some(last_newline) = pending.iter().rposition(|&b| b == b'\n') else {
            continue;
        };
        let complete: Vec<u8> = pending.drain(..=last_newline).collect();

        for line in String::from_utf8_lossy(&complete).lines() {
            if line.contains("LOST") && line.contains("EVENTS") {
                tracing::warn!("kernel dropped probe events: {}", line.trim());
                continue;
            }
            let Some(event) = parse_trace_line(line) else {
                continue;
            };
            if events.send(event).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    #[test]
    fn test_parse_entry_line() {
        let line = "          python-12345   [003] d.... 1234.567890: lock_enter_0: (0x7f12a4b0c9d0) lock=0x55d0c0ffee00";
        assert_eq!(
            parse_trace_line(line),
            Some(ProbeEvent::Entry {
                thread: 12345,
                lock: 0x55d0c0ffee00,
                timestamp_ns: 1_234_567_890_000,
            })
        );
    }

    #[test]
    fn test_parse_exit_line() {
        let line = "          python-12345   [001] d.... 1234.600000: lock_exit_0: (0x7f12a4b0d000 <- 0x7f12a4b0c9d0)";
        assert_eq!(
            parse_trace_line(line),
            Some(ProbeEvent::Exit {
                thread: 12345,
                timestamp_ns: 1_234_600_000_000,
            })
        );
    }

    #[test]
    fn test_parse_line_with_tgid_and_dashes_in_comm() {
        let line = " my-worker-thread-77 (   70) [000] .... 5.000001: lock_enter_2: (0x1) lock=0x10";
        assert_eq!(
            parse_trace_line(line),
            Some(ProbeEvent::Entry {
                thread: 77,
                lock: 0x10,
                timestamp_ns: 5_000_001_000,
            })
        );
    }

    #[test]
    fn test_parse_line_without_flags() {
        let line = "python-9 [000] 7.5: lock_exit_0: (0x2 <- 0x1)";
        assert_eq!(
            parse_trace_line(line),
            Some(ProbeEvent::Exit {
                thread: 9,
                timestamp_ns: 7_500_000_000,
            })
        );
    }

    #[test]
    fn test_parse_ignores_other_lines() {
        assert_eq!(parse_trace_line("# tracer: nop"), None);
        assert_eq!(parse_trace_line("CPU:2 [LOST 14 EVENTS]"), None);
        assert_eq!(
            parse_trace_line("  bash-1 [000] .... 1.000000: sched_switch: prev_comm=bash"),
            None
        );
        assert_eq!(parse_trace_line(""), None);
    }

    #[test]
    fn test_entry_without_lock_field_is_rejected() {
        let line = "python-1 [000] .... 1.000000: lock_enter_0: (0x1)";
        assert_eq!(parse_trace_line(line), None);
    }

    #[test]
    fn test_parse_decimal_lock_field() {
        assert_eq!(parse_lock_field(" (0x1) lock=4096"), Some(4096));
    }

    #[test]
    fn test_timestamp_precision() {
        assert_eq!(parse_timestamp_ns("0.000001"), Some(1_000));
        assert_eq!(parse_timestamp_ns("2.5"), Some(2_500_000_000));
        assert_eq!(parse_timestamp_ns("3.123456789"), Some(3_123_456_789));
        assert_eq!(parse_timestamp_ns("3.1234567891"), None);
        assert_eq!(parse_timestamp_ns("3."), None);
        assert_eq!(parse_timestamp_ns("abc"), None);
    }

    #[test]
    fn test_probe_definitions() {
        let lib = Path::new("/usr/lib/libpthread.so.0");
        let entry = entry_probe_definition("gilstats_42", 0, lib, 0x10a80);
        assert_eq!(
            entry,
            format!("p:gilstats_42/lock_enter_0 /usr/lib/libpthread.so.0:0x10a80 lock={}:x64", FIRST_ARG)
        );
        let ret = return_probe_definition("gilstats_42", 1, lib, 0x10a80);
        assert_eq!(ret, "r:gilstats_42/lock_exit_1 /usr/lib/libpthread.so.0:0x10a80");
    }

    #[test]
    fn test_locate_rejects_dir_without_uprobe_events() {
        let dir = tempfile::tempdir().unwrap();
        let err = TraceFs::locate(Some(dir.path())).unwrap_err();
        assert!(matches!(err, GilStatsError::TraceFsUnavailable { .. }));
    }

    #[test]
    fn test_locate_accepts_override() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("uprobe_events"), "").unwrap();
        let tracefs = TraceFs::locate(Some(dir.path())).unwrap();
        assert_eq!(tracefs.root(), dir.path());
    }

    #[test]
    fn test_append_keeps_existing_lines() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("uprobe_events"), "").unwrap();
        let tracefs = TraceFs::locate(Some(dir.path())).unwrap();
        tracefs.append("uprobe_events", "p:a/b x:0x1").unwrap();
        tracefs.append("uprobe_events", "r:a/c x:0x1").unwrap();

        let contents = fs::read_to_string(dir.path().join("uprobe_events")).unwrap();
        assert_eq!(contents, "p:a/b x:0x1\nr:a/c x:0x1\n");
    }

    fn idle_session(tracefs: TraceFs, pid: i32) -> UprobeSession {
        let group = probe_group(pid);
        UprobeSession {
            instance: PathBuf::from("instances").join(&group),
            tracefs,
            group,
            instance_created: false,
            events_enabled: false,
            probes: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    #[test]
    fn test_stale_cleanup_tolerates_busy_instance() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("uprobe_events"), "").unwrap();
        let group = probe_group(4242);
        fs::create_dir_all(dir.path().join("events").join(&group).join("lock_enter_0")).unwrap();
        // a non-empty instance directory cannot be removed
        let instance = dir.path().join("instances").join(&group);
        fs::create_dir_all(&instance).unwrap();
        fs::write(instance.join("trace"), "").unwrap();

        let tracefs = TraceFs::locate(Some(dir.path())).unwrap();
        let session = idle_session(tracefs, 4242);
        session.remove_stale();

        assert!(instance.exists());
        let contents = fs::read_to_string(dir.path().join("uprobe_events")).unwrap();
        assert_eq!(contents, format!("-:{}/lock_enter_0\n", group));
    }

    #[test]
    fn test_stale_cleanup_tolerates_missing_control_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("uprobe_events"), "").unwrap();
        let tracefs = TraceFs::locate(Some(dir.path())).unwrap();
        let group = probe_group(4343);
        fs::create_dir_all(dir.path().join("events").join(&group).join("lock_exit_0")).unwrap();
        fs::remove_file(dir.path().join("uprobe_events")).unwrap();

        let session = idle_session(tracefs, 4343);
        session.remove_stale();

        assert!(!dir.path().join("uprobe_events").exists());
    }

    #[test]
    fn test_own_thread_ids_include_pid() {
        let pid = std::process::id();
        let tids = thread_ids(pid as i32).unwrap();
        assert!(tids.contains(&pid));
    }

    #[test]
    fn test_reader_forwards_parsed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace_pipe");
        fs::write(
            &path,
            "python-5 [000] .... 1.000000: lock_enter_0: (0x1) lock=0xa\n\
             CPU:0 [LOST 3 EVENTS]\n\
             python-5 [000] .... 1.000500: lock_exit_0: (0x2 <- 0x1)\n",
        )
        .unwrap();

        let (tx, rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);
        let pipe = fs::File::open(&path).unwrap();
        let reader = thread::spawn(move || read_trace_pipe(pipe, tx, stop));

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        shutdown.store(true, Ordering::SeqCst);
        reader.join().unwrap();

        assert!(matches!(first, ProbeEvent::Entry { thread: 5, lock: 0xa, .. }));
        assert!(matches!(second, ProbeEvent::Exit { thread: 5, .. }));
    }
}
