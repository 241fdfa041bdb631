//! # Core Engine Module
//!
//! The data path of the FinStream engine and the task that supervises it.
//!
//! ## Core Components:
//!
//! - **`tick`**: the `Tick` value and the parser for the ingestor stdout protocol.
//!
//! - **`backpressure`**: a pure policy deciding, from a bounded queue's depth and
//!   how long it stayed above its high-water mark, whether a producer must die.
//!
//! - **`arena`**: the single-writer freshness ranking. Lag per asset, degraded
//!   classification and severity, republished as snapshots.
//!
//! - **`dispatcher`**: per-client bounded fan-out of ticks. Subscriber demand is
//!   forwarded to the supervisor.
//!
//! - **`supervisor`**: the per-asset lifecycle state machine. Launches, drains,
//!   restarts and kills ingestor processes in response to demand, market status,
//!   configuration and operator commands.
//!
//! - **`telemetry`**: periodic reports assembled from the published snapshots.

/// Tick value and ingestor line parsing.
pub mod tick;
/// Kill/keep decision for bounded producer queues.
pub mod backpressure;
/// Freshness ranking of live sources.
pub mod arena;
/// Per-client fan-out of ticks.
pub mod dispatcher;
/// Ingestor lifecycle state machine.
pub mod supervisor;
/// Periodic engine reports.
pub mod telemetry;

pub use arena::{Arena, ArenaEntry, ArenaHandle, ArenaService, RankedSource, RankingSnapshot};
pub use backpressure::{BackpressurePolicy, BackpressureVerdict, KillReason, PolicyError};
pub use dispatcher::{Dispatcher, TickSink};
pub use supervisor::{AssetView, AssetViews, Supervisor, SupervisorError, SupervisorHandle};
pub use telemetry::{Telemetry, TelemetrySnapshot};
pub use tick::{parse_line, IngestorLine, Tick, TickParseError};
