//! # Logging Module
//!
//! Process-wide `tracing` setup and the pieces that feed it.
//!
//! ## Core Components:
//!
//! - **`init_logging`**: installs a registry with a reloadable `EnvFilter`, a
//!   human-readable console layer and a JSON file layer rolling daily through a
//!   non-blocking `tracing-appender` writer.
//! - **`set_log_level`**: swaps the filter at runtime. The bus logger calls it
//!   when a reloaded configuration changes `logLevel`.
//! - **`bus_logger`**: writes one structured record per control-plane event.
//! - **`logrecord`**: re-emits log lines printed by ingestors.

use std::path::Path;

use parking_lot::RwLock;
use static_init::dynamic;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// Structured logging of bus events.
pub mod bus_logger;
/// Ingestor log records.
pub mod logrecord;

pub use bus_logger::run_bus_logger;
pub use logrecord::{IngestorLogRecord, LogLevel};

/// Prefix of the daily log files (`finstream.YYYY-MM-DD`).
pub const LOG_FILE_PREFIX: &str = "finstream";

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Reload handle of the installed filter; empty until [`init_logging`] ran.
#[dynamic]
static FILTER_HANDLE: RwLock<Option<FilterHandle>> = RwLock::new(None);

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("cannot create log directory {path}: {source}")]
    LogDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid log directive {directive:?}: {source}")]
    Directive {
        directive: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("a global tracing subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
    #[error("failed to swap log filter: {0}")]
    Reload(#[from] reload::Error),
    #[error("logging is not initialized")]
    NotInitialized,
}

fn parse_filter(directive: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_new(directive).map_err(|source| LoggingError::Directive {
        directive: directive.to_string(),
        source,
    })
}

/// # Setup Logging
///
/// Console output is human-readable with ANSI colors; the file output under
/// `log_dir` is JSON, one file per day. `RUST_LOG`, when set, wins over `level`.
///
/// The returned guard flushes the file writer when dropped, so the caller keeps
/// it alive for the life of the process.
pub fn init_logging(log_dir: &Path, level: &str) -> Result<WorkerGuard, LoggingError> {
    std::fs::create_dir_all(log_dir).map_err(|source| LoggingError::LogDir {
        path: log_dir.display().to_string(),
        source,
    })?;
    let (writer, guard) = non_blocking(rolling::daily(log_dir, LOG_FILE_PREFIX));

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(level)?,
    };
    let (filter, handle) = reload::Layer::new(filter);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);
    let file_layer = fmt::layer().with_ansi(false).with_writer(writer).json();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;
    *FILTER_HANDLE.write() = Some(handle);

    tracing::info!(level, log_dir = %log_dir.display(), "logging initialized");
    Ok(guard)
}

/// Replaces the active filter with `directive`.
pub fn set_log_level(directive: &str) -> Result<(), LoggingError> {
    let filter = parse_filter(directive)?;
    let guard = FILTER_HANDLE.read();
    let handle = guard.as_ref().ok_or(LoggingError::NotInitialized)?;
    handle.reload(filter)?;
    tracing::info!(directive, "log level changed");
    Ok(())
}
