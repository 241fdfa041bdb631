//! # Nasdaq Market Status
//!
//! Reads `api/market-info` and turns it into a [`MarketReading`] for the oracle.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::apicall::NasdaqClient;
use crate::markets::oracle::{MarketReading, OracleError, StatusSource};
use crate::retrieve::ky_http::ApiError;
use crate::sysbus::MarketState;

pub const MARKET_INFO_PATH: &str = "api/market-info";

/// Pre-market opens at 04:00 New York time.
const PRE_MARKET_HOUR: u32 = 4;

/// The `data` object of `api/market-info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketStatusData {
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub market_indicator: String,
    #[serde(default)]
    pub ui_market_indicator: String,
    #[serde(default)]
    pub market_count_down: String,
    #[serde(default)]
    pub pre_market_opening_time: String,
    #[serde(default)]
    pub pre_market_closing_time: String,
    #[serde(default)]
    pub market_opening_time: String,
    #[serde(default)]
    pub market_closing_time: String,
    #[serde(default)]
    pub after_hours_market_opening_time: String,
    #[serde(default)]
    pub after_hours_market_closing_time: String,
    #[serde(default)]
    pub previous_trade_date: String,
    /// e.g. `"Jan 2, 2025"`.
    pub next_trade_date: String,
    #[serde(default)]
    pub is_business_day: bool,
    pub mrkt_status: String,
    #[serde(default)]
    pub mrkt_count_down: String,

    #[serde(rename = "pmOpenRaw")]
    pub pm_open_raw: NaiveDateTime,
    #[serde(rename = "ahCloseRaw")]
    pub ah_close_raw: NaiveDateTime,
    #[serde(rename = "openRaw")]
    pub open_raw: NaiveDateTime,
    #[serde(rename = "closeRaw")]
    pub close_raw: NaiveDateTime,
}

impl MarketStatusData {
    pub fn state(&self) -> Option<MarketState> {
        MarketState::from_nasdaq(&self.mrkt_status)
    }

    /// Time from `now` (New York wall clock) until the next pre-market open.
    ///
    /// Today's pre-market or regular open when still ahead, otherwise 04:00 on
    /// `next_trade_date` (weekends and holidays). `None` if nothing lies ahead.
    pub fn time_until_open(&self, now: NaiveDateTime) -> Option<Duration> {
        let mut target = if now < self.pm_open_raw {
            self.pm_open_raw
        } else {
            self.open_raw
        };
        if target <= now {
            if let Some(next) = NaiveDate::parse_from_str(&self.next_trade_date, "%b %d, %Y")
                .ok()
                .and_then(|d| d.and_hms_opt(PRE_MARKET_HOUR, 0, 0))
            {
                target = next;
            }
        }
        (target > now).then(|| (target - now).to_std().ok()).flatten()
    }
}

/// Live market-status source backed by the Nasdaq API.
pub struct NasdaqStatusSource {
    client: NasdaqClient,
    tz: Tz,
}

impl NasdaqStatusSource {
    /// `tz` is the zone Nasdaq's raw timestamps are expressed in.
    pub fn new(tz: Tz) -> Result<Self, ApiError> {
        Ok(Self::with_client(NasdaqClient::new()?, tz))
    }

    pub fn with_client(client: NasdaqClient, tz: Tz) -> Self {
        Self { client, tz }
    }

    /// Fetches and decodes the raw status record.
    pub async fn status(&self) -> Result<MarketStatusData, OracleError> {
        let data = self.client.fetch(MARKET_INFO_PATH).await?;
        serde_json::from_value(data).map_err(OracleError::Payload)
    }
}

#[async_trait]
impl StatusSource for NasdaqStatusSource {
    async fn fetch(&self) -> Result<MarketReading, OracleError> {
        let data = self.status().await?;
        let state = data
            .state()
            .ok_or_else(|| OracleError::UnknownStatus(data.mrkt_status.clone()))?;
        let now = Utc::now().with_timezone(&self.tz).naive_local();
        let next_open_in = if state.allows_ingestion() {
            None
        } else {
            data.time_until_open(now)
        };
        tracing::debug!(%state, raw = %data.mrkt_status, ?next_open_in, "nasdaq market status");
        Ok(MarketReading { state, next_open_in })
    }
}
