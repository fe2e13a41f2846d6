//! Logging setup for the nearcast binary.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter for a `-v` count; `RUST_LOG` overrides it.
pub fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn,nearcast_lib=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber: console output, plus a daily rolling file
/// when `log_dir` is given. Keep the returned guard alive until exit or the
/// file writer loses buffered lines.
pub fn init(verbosity: u8, log_dir: Option<&Path>) -> std::io::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(verbosity)));

    let console = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let (file, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "nearcast.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(non_blocking);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // A second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init();

    Ok(guard)
}
