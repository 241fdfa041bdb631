//! # Ingestor Log Records
//!
//! Ingestors may interleave log lines with ticks on stdout. A log line is a JSON
//! object carrying `message` (or `msg`) and an optional `level`, given either as
//! the numeric scale below or as a level name. Records are re-emitted through
//! `tracing` under the `ingestor` target, tagged with the asset id.
//!
//! | Number | Name  | `tracing` level |
//! |--------|-------|-----------------|
//! | 0      | silly | TRACE           |
//! | 1      | trace | TRACE           |
//! | 2      | debug | DEBUG           |
//! | 3      | info  | INFO            |
//! | 4      | warn  | WARN            |
//! | 5      | error | ERROR           |
//! | 6      | fatal | ERROR           |

use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// Severity of an ingestor log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silly = 0,
    Trace = 1,
    Debug = 2,
    Info = 3,
    Warn = 4,
    Error = 5,
    Fatal = 6,
}

impl LogLevel {
    /// Maps the numeric scale; out-of-range values clamp to the nearest end.
    pub fn from_number(n: i64) -> Self {
        match n {
            i64::MIN..=0 => LogLevel::Silly,
            1 => LogLevel::Trace,
            2 => LogLevel::Debug,
            3 => LogLevel::Info,
            4 => LogLevel::Warn,
            5 => LogLevel::Error,
            _ => LogLevel::Fatal,
        }
    }

    /// Maps a level name, case-insensitively. `warning` and `err` are accepted.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "silly" => Some(LogLevel::Silly),
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" | "err" => Some(LogLevel::Error),
            "fatal" | "critical" => Some(LogLevel::Fatal),
            _ => None,
        }
    }

    /// Reads the `level` field of a record. Missing or unreadable means `Info`.
    pub fn from_json(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Number(n)) => n.as_i64().map(Self::from_number).unwrap_or(LogLevel::Info),
            Some(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .ok()
                .map(Self::from_number)
                .or_else(|| Self::from_name(s))
                .unwrap_or(LogLevel::Info),
            _ => LogLevel::Info,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Silly => "silly",
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// One log line emitted by an ingestor process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestorLogRecord {
    pub level: LogLevel,
    pub message: String,
}

impl IngestorLogRecord {
    /// Re-emits the record through `tracing`.
    pub fn emit(&self, asset_id: &str) {
        let level = self.level;
        let message = self.message.as_str();
        match level {
            LogLevel::Silly | LogLevel::Trace => {
                tracing::trace!(target: "ingestor", asset = asset_id, %level, "{message}")
            }
            LogLevel::Debug => tracing::debug!(target: "ingestor", asset = asset_id, %level, "{message}"),
            LogLevel::Info => tracing::info!(target: "ingestor", asset = asset_id, %level, "{message}"),
            LogLevel::Warn => tracing::warn!(target: "ingestor", asset = asset_id, %level, "{message}"),
            LogLevel::Error | LogLevel::Fatal => {
                tracing::error!(target: "ingestor", asset = asset_id, %level, "{message}")
            }
        }
    }
}
