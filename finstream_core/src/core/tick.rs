//! # Ticks and the Ingestor Line Protocol
//!
//! Ingestors write newline-delimited JSON to stdout. Each line is either a tick
//! (a `price` plus an exchange timestamp) or a log record (`message`/`msg` with
//! an optional `level`). Everything else is malformed.
//!
//! Prices are read from the raw JSON text and parsed straight into a
//! [`Decimal`], so `101.10` stays `101.10` and never passes through a float.
//!
//! Accepted timestamp keys, first match wins: `timestamp`, `ts`, `exchangeTs`,
//! `time`. Accepted forms:
//!
//! - epoch number (or numeric string): seconds below 1e11, milliseconds below
//!   1e14, microseconds otherwise;
//! - RFC 3339;
//! - naive `YYYY-MM-DD HH:MM:SS[.fff]` (or with `T`), read in the reference
//!   timezone.

use std::str::FromStr;

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use thiserror::Error;

use crate::loggers::logrecord::{IngestorLogRecord, LogLevel};

/// One price observation from an ingestor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub asset_id: String,
    pub price: Decimal,
    /// When the exchange says the trade or quote happened.
    pub exchange_ts: DateTime<Utc>,
    /// When the engine read the line from the ingestor.
    pub received_at: DateTime<Utc>,
}

impl Tick {
    /// `received_at - exchange_ts` in milliseconds. Negative when the
    /// exchange clock runs ahead of ours.
    pub fn lag_ms(&self) -> i64 {
        (self.received_at - self.exchange_ts).num_milliseconds()
    }
}

/// A successfully classified stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestorLine {
    Tick(Tick),
    Log(IngestorLogRecord),
}

/// Why a stdout line was rejected.
#[derive(Debug, Error)]
pub enum TickParseError {
    #[error("line is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),
    #[error("line carries neither a price nor a log message")]
    Unrecognized,
    #[error("invalid price {0:?}")]
    InvalidPrice(String),
    #[error("tick carries no timestamp")]
    MissingTimestamp,
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
}

#[derive(Deserialize)]
struct WireLine<'a> {
    #[serde(borrow, default)]
    price: Option<&'a RawValue>,
    #[serde(borrow, default)]
    timestamp: Option<&'a RawValue>,
    #[serde(borrow, default)]
    ts: Option<&'a RawValue>,
    #[serde(borrow, default, rename = "exchangeTs")]
    exchange_ts: Option<&'a RawValue>,
    #[serde(borrow, default)]
    time: Option<&'a RawValue>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    level: Option<Value>,
}

/// Classifies one stdout line of `asset_id`.
///
/// `tz` is the zone naive timestamps are read in.
pub fn parse_line(
    asset_id: &str,
    line: &str,
    received_at: DateTime<Utc>,
    tz: Tz,
) -> Result<IngestorLine, TickParseError> {
    let wire: WireLine<'_> = serde_json::from_str(line.trim())?;

    if let Some(raw_price) = wire.price {
        let price = parse_price(raw_price)?;
        let raw_ts = wire
            .timestamp
            .or(wire.ts)
            .or(wire.exchange_ts)
            .or(wire.time)
            .ok_or(TickParseError::MissingTimestamp)?;
        let exchange_ts = parse_timestamp(raw_ts, tz)?;
        return Ok(IngestorLine::Tick(Tick {
            asset_id: asset_id.to_string(),
            price,
            exchange_ts,
            received_at,
        }));
    }

    match wire.message.or(wire.msg) {
        Some(message) => Ok(IngestorLine::Log(IngestorLogRecord {
            level: LogLevel::from_json(wire.level.as_ref()),
            message,
        })),
        None => Err(TickParseError::Unrecognized),
    }
}

/// Unquotes a JSON string literal; numbers and other scalars come back as written.
fn raw_text(raw: &RawValue) -> Option<String> {
    let text = raw.get().trim();
    if text.starts_with('"') {
        serde_json::from_str::<String>(text).ok()
    } else {
        Some(text.to_string())
    }
}

fn parse_price(raw: &RawValue) -> Result<Decimal, TickParseError> {
    let invalid = || TickParseError::InvalidPrice(raw.get().to_string());
    let text = raw_text(raw).ok_or_else(invalid)?;
    let text = text.trim();
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map_err(|_| invalid())
}

fn parse_timestamp(raw: &RawValue, tz: Tz) -> Result<DateTime<Utc>, TickParseError> {
    let invalid = || TickParseError::InvalidTimestamp(raw.get().to_string());
    let text = raw_text(raw).ok_or_else(invalid)?;
    let text = text.trim();

    if let Ok(epoch) = Decimal::from_str(text).or_else(|_| Decimal::from_scientific(text)) {
        return from_epoch(epoch).ok_or_else(invalid);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return match tz.from_local_datetime(&naive) {
                LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
                LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
                LocalResult::None => Err(invalid()),
            };
        }
    }
    Err(invalid())
}

/// Epoch seconds, milliseconds or microseconds, told apart by magnitude.
fn from_epoch(epoch: Decimal) -> Option<DateTime<Utc>> {
    let magnitude = epoch.abs();
    let to_micros = if magnitude < Decimal::from(100_000_000_000_i64) {
        Decimal::from(1_000_000)
    } else if magnitude < Decimal::from(100_000_000_000_000_i64) {
        Decimal::from(1_000)
    } else {
        Decimal::ONE
    };
    let micros = epoch.checked_mul(to_micros)?.trunc().to_i64()?;
    DateTime::<Utc>::from_timestamp_micros(micros)
}
