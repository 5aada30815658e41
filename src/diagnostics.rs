//! Logging setup for embedders.
//!
//! Builds a `tracing` subscriber with an env-filter layer and, when a log
//! directory is given, a daily-rotated non-blocking file layer alongside
//! stderr output.

use crate::error::{CallError, Result};
use std::path::Path;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Keeps the non-blocking file writer alive; drop it at process exit to
/// flush buffered log lines.
pub struct LogGuard {
    _file: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialize global logging.
///
/// The filter comes from `RUST_LOG`, defaulting to `info`. With a log
/// directory, records are additionally written to a daily-rotated
/// `voxcall.log.*` file.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed or the
/// log directory cannot be created.
pub fn init_logging(log_dir: Option<&Path>) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "voxcall.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .try_init()
                .map_err(|e| CallError::Config(format!("logging init failed: {e}")))?;
            Ok(LogGuard {
                _file: Some(guard),
            })
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| CallError::Config(format!("logging init failed: {e}")))?;
            Ok(LogGuard { _file: None })
        }
    }
}
