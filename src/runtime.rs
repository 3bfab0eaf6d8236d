//! Target resolution: which library and symbol to probe in a PID
//!
//! The interpreter lock waits in a different libc call depending on the
//! Python major version, so the version is read from the target's own
//! executable (`<exe> --version`) before anything is attached.

use crate::error::{GilStatsError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Supported interpreter major versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeVersion {
    Python2,
    Python3,
}

impl RuntimeVersion {
    /// Symbol the interpreter lock blocks in for this version
    pub fn symbol_pattern(self) -> &'static str {
        match self {
            RuntimeVersion::Python2 => "^sem_wait$",
            RuntimeVersion::Python3 => "^pthread_cond_timedwait$",
        }
    }

    pub fn major(self) -> u32 {
        match self {
            RuntimeVersion::Python2 => 2,
            RuntimeVersion::Python3 => 3,
        }
    }
}

/// Library path and symbol pattern to attach to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub pid: i32,
    pub library: PathBuf,
    pub symbol_pattern: String,
}

/// Executable path of a running process
pub fn executable_path(pid: i32) -> Result<PathBuf> {
    let proc_dir = PathBuf::from(format!("/proc/{}", pid));
    if !proc_dir.exists() {
        return Err(GilStatsError::ProcessNotFound { pid });
    }
    fs::read_link(proc_dir.join("exe"))
        .map_err(|source| GilStatsError::ExecutableUnreadable { pid, source })
}

/// Run `<exe> --version` and classify the interpreter
pub fn probe_runtime_version(executable: &Path) -> Result<RuntimeVersion> {
    let output = Command::new(executable)
        .arg("--version")
        .output()
        .map_err(|e| GilStatsError::VersionProbe {
            path: executable.to_path_buf(),
            detail: e.to_string(),
        })?;

    // Python 2 prints its banner on stderr, Python 3 on stdout
    let mut banner = String::from_utf8_lossy(&output.stdout).into_owned();
    banner.push_str(&String::from_utf8_lossy(&output.stderr));

    parse_version_banner(&banner, executable)
}

/// Classify a `Python X.Y.Z` banner
pub fn parse_version_banner(banner: &str, executable: &Path) -> Result<RuntimeVersion> {
    let probe_err = |detail: &str| GilStatsError::VersionProbe {
        path: executable.to_path_buf(),
        detail: detail.to_string(),
    };

    let banner = banner.trim_start();
    if !banner.starts_with("Python") {
        return Err(probe_err("version banner does not start with 'Python'"));
    }

    let major = banner
        .split_whitespace()
        .nth(1)
        .and_then(|version| version.chars().next())
        .and_then(|c| c.to_digit(10))
        .ok_or_else(|| probe_err("no version number after 'Python'"))?;

    match major {
        2 => Ok(RuntimeVersion::Python2),
        3 => Ok(RuntimeVersion::Python3),
        major => Err(GilStatsError::UnsupportedVersion {
            path: executable.to_path_buf(),
            major,
        }),
    }
}

/// Pick the threading library out of a `/proc/PID/maps` listing
///
/// Prefers `libpthread`; newer glibc folds pthreads into `libc.so`.
pub fn find_threading_library(maps: &str) -> Option<PathBuf> {
    let mapped: Vec<&str> = maps
        .lines()
        .filter_map(|line| line.split_whitespace().nth(5))
        .filter(|path| path.starts_with('/'))
        .collect();

    let named = |prefix: &str| {
        mapped
            .iter()
            .find(|path| {
                Path::new(path)
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(prefix))
            })
            .map(|path| PathBuf::from(*path))
    };

    named("libpthread").or_else(|| named("libc.so")).or_else(|| named("libc-"))
}

/// Resolve the probe target for a PID
///
/// `library` and `symbol` override the automatic choices; an override
/// still requires the process to exist.
pub fn resolve_target(
    pid: i32,
    library: Option<&Path>,
    symbol: Option<&str>,
) -> Result<ProbeTarget> {
    let executable = executable_path(pid)?;
    tracing::debug!("PID {} runs {}", pid, executable.display());

    let symbol_pattern = match symbol {
        Some(pattern) => pattern.to_string(),
        None => {
            let version = probe_runtime_version(&executable)?;
            tracing::debug!("detected Python major version {}", version.major());
            version.symbol_pattern().to_string()
        }
    };

    let library = match library {
        Some(path) => path.to_path_buf(),
        None => {
            let maps = fs::read_to_string(format!("/proc/{}/maps", pid))?;
            find_threading_library(&maps).ok_or(GilStatsError::LibraryNotFound { pid })?
        }
    };

    if library.as_os_str().is_empty() {
        return Err(GilStatsError::LibraryNotFound { pid });
    }

    Ok(ProbeTarget {
        pid,
        library,
        symbol_pattern,
    })
}
