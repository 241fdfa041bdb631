//! # Financial Market Status Module
//!
//! Knows whether the market is trading, and tells the rest of the engine.
//!
//! ## Contained Modules:
//!
//! - **`oracle`**: the market status oracle. Polls a [`StatusSource`] in live
//!   mode or holds an operator-set state in simulated mode, and publishes
//!   `MarketStatus` on the bus whenever the state changes.
//!
//! - **`nasdaq`** (feature `nasdaq`): the live source reading Nasdaq's
//!   `api/market-info`.

/// Market status oracle.
pub mod oracle;
/// Nasdaq market-info client and status source.
#[cfg(feature = "nasdaq")]
pub mod nasdaq;

pub use oracle::{next_poll_delay, MarketOracle, MarketReading, OracleError, StatusSource};
