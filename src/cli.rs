//! CLI argument parsing for gilstats

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "gilstats")]
#[command(version)]
#[command(about = "Time/Print GIL stats per-thread", long_about = None)]
#[command(after_help = "examples:\n    gilstats -p 1234              # trace process 1234")]
pub struct Cli {
    /// Trace this PID only
    #[arg(short = 'p', long = "pid", value_name = "PID")]
    pub pid: i32,

    /// Shared library to probe instead of the one found in the process mappings
    #[arg(long = "library", value_name = "PATH")]
    pub library: Option<PathBuf>,

    /// Symbol regex to probe instead of the one implied by the Python version
    #[arg(long = "symbol", value_name = "REGEX")]
    pub symbol: Option<String>,

    /// tracefs mount point (default: /sys/kernel/tracing, then /sys/kernel/debug/tracing)
    #[arg(long = "tracefs", value_name = "DIR")]
    pub tracefs: Option<PathBuf>,

    /// How often the collection loop checks for a stop request
    #[arg(
        long = "interval-ms",
        value_name = "MS",
        default_value = "100",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub interval_ms: u64,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long = "duration", value_name = "SECS")]
    pub duration: Option<f64>,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}
