//! Structured logging via `tracing-subscriber` and `tracing-appender`.
//!
//! The daemon writes daily-rotated JSON files plus a human-readable
//! stderr layer; one-shot subcommands get stderr only. Filtering is
//! controlled by `RUST_LOG` (default `info`).

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// File name stem for rotated logs.
const LOG_FILE_STEM: &str = "minka.log";

/// Keeps the non-blocking file writer alive.
///
/// Dropping the guard flushes pending entries and closes the file, so it
/// must live as long as the process logs.
pub struct LoggingGuard {
    _worker: Option<WorkerGuard>,
}

impl LoggingGuard {
    fn console_only() -> Self {
        Self { _worker: None }
    }
}

/// Initialise daemon logging: JSON files under `logs_dir` with daily
/// rotation (`minka.log.YYYY-MM-DD`) plus a stderr layer.
///
/// # Errors
///
/// Fails when `logs_dir` cannot be created.
pub fn init_production(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!("failed to create logs directory {}: {e}", logs_dir.display())
    })?;

    let (file_writer, worker) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_FILE_STEM));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().json().with_writer(file_writer))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(LoggingGuard {
        _worker: Some(worker),
    })
}

/// Initialise stderr-only logging for one-shot subcommands.
pub fn init_cli() -> LoggingGuard {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    LoggingGuard::console_only()
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
