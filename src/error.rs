//! Error taxonomy for gilstats
//!
//! Resolution and attach failures are fatal before collection starts.
//! `NoCandidate` is fatal at shutdown. A missing entry record on exit is
//! not an error at all (see [`crate::correlation::EntryStore::on_exit`]).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GilStatsError {
    #[error("No process with PID {pid} found")]
    ProcessNotFound { pid: i32 },

    #[error("Could not read executable path of PID {pid}: {source}")]
    ExecutableUnreadable {
        pid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not retrieve the Python version from the binary {}: {detail}", path.display())]
    VersionProbe { path: PathBuf, detail: String },

    #[error("Unsupported Python major version {major} for binary {}", path.display())]
    UnsupportedVersion { path: PathBuf, major: u32 },

    #[error("Unable to find a threading library mapped into PID {pid}")]
    LibraryNotFound { pid: i32 },

    #[error("No symbol matching {pattern} in {}", library.display())]
    SymbolNotFound { library: PathBuf, pattern: String },

    #[error("Failed to parse ELF object {}: {detail}", path.display())]
    ElfParse { path: PathBuf, detail: String },

    #[error("tracefs is not mounted or uprobe_events is missing (tried: {tried})")]
    TraceFsUnavailable { tried: String },

    #[error("Failed to attach probes: {detail}")]
    Attach { detail: String },

    #[error(
        "No gil candidate found after examining {examined} aggregates. \
         Maybe symbols are not intercepted properly? Try --library or --symbol"
    )]
    NoCandidate { examined: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GilStatsError>;
