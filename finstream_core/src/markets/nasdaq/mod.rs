//! # Nasdaq API Integration Module
//!
//! ## Contained Modules:
//!
//! - **`apicall`**: the Nasdaq HTTP client: browser-mimicking headers and the
//!   `rCode` envelope check with its own retry loop.
//!
//! - **`marketstatus`**: the `api/market-info` record and the live
//!   [`StatusSource`](crate::markets::oracle::StatusSource) built on it.

/// Nasdaq HTTP client.
pub mod apicall;
/// Market status record and live status source.
pub mod marketstatus;

pub use apicall::NasdaqClient;
pub use marketstatus::{MarketStatusData, NasdaqStatusSource};
