use anyhow::{Context, Result};
use clap::Parser;
use gilstats::{cli::Cli, collector::StopSignal, tracer};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn tracer_config(args: &Cli) -> Result<tracer::TracerConfig> {
    let duration = match args.duration {
        Some(secs) => Some(
            Duration::try_from_secs_f64(secs)
                .with_context(|| format!("Invalid value for --duration: {}", secs))?,
        ),
        None => None,
    };

    Ok(tracer::TracerConfig {
        pid: args.pid,
        library: args.library.clone(),
        symbol: args.symbol.clone(),
        tracefs: args.tracefs.clone(),
        poll_interval: Duration::from_millis(args.interval_ms),
        duration,
    })
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);

    let config = tracer_config(&args)?;
    let report = tracer::attach_to_pid(&config, StopSignal::new(), |target| {
        println!(
            "Attaching {}:{}. Hit Ctrl+C to stop.",
            target.library.display(),
            target.symbol_pattern
        );
    })?;

    println!("{}", report);
    Ok(())
}
