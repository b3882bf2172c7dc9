//! Logging setup for hosts embedding the engine.
//!
//! The engine logs through `tracing` everywhere, so a host that
//! already runs its own subscriber can skip this module. For binaries
//! and harnesses without one, [`init_logging`] installs the
//! conventional setup:
//! - appends single-line events to a log file (never truncates)
//! - mirrors them to stdout for tailing
//! - honors `RUST_LOG`, defaulting to `info`

use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default log file name.
pub const DEFAULT_LOG_FILE: &str = "netfence.log";

/// Keeps the non-blocking log writer alive.
///
/// Dropping the guard flushes and closes the file writer, so hold it
/// for the life of the process.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Install the global subscriber, logging to both a file under
/// `log_dir` and stdout.
///
/// The log file is shared with whatever the host already keeps there;
/// it is appended to, never cleared.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created.
pub fn init_logging(log_dir: impl AsRef<Path>, log_file: &str) -> Result<LoggingGuard, io::Error> {
    let log_dir = log_dir.as_ref();
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true);

    let stdout_layer = tracing_subscriber::fmt::layer().with_writer(io::stdout);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
