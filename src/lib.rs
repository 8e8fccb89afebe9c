//! panebridge library
//!
//! Drives assistant CLIs that live in terminal multiplexer panes: creates and
//! tracks their sessions per working directory, delivers messages into the
//! panes and scrapes replies back out between per-task markers.

pub mod app;
pub mod backend;
pub mod cache;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod environment;
pub mod error;
pub mod mux;
pub mod notify;
pub mod probe;
pub mod session;
pub mod ui;

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;

use crate::config::LogConfig;

/// Application result type for consistent error handling
pub type AppResult<T> = anyhow::Result<T>;

/// Initialize tracing subscriber for logging.
///
/// Logs go to stderr and, when `log.file_path` is set, to that file as well.
/// Keep the returned guard alive until exit so buffered file output is
/// flushed.
pub fn init_logging(level: &str, log: &LogConfig) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("panebridge={}", level).into());
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    if log.file_path.trim().is_empty() {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;
        return Ok(None);
    }

    let path = Path::new(&log.file_path);
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let file_name = path
        .file_name()
        .context("Log file path has no file name")?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer().with_writer(writer).with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(Some(guard))
}
