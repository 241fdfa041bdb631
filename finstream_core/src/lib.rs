//! # FinStream Core
//!
//! The data-plane core of the FinStream engine: it supervises external ingestor
//! processes, enforces backpressure on their output, ranks sources by freshness
//! and carries a control plane that never stalls the data path.
//!
//! ## Modules:
//!
//! - **`sysbus`**: the lossy control-plane event bus and its vocabulary.
//! - **`configs`**: engine configuration, validation and atomic reload.
//! - **`core`**: backpressure policy, tick parsing, arena, fan-out dispatcher,
//!   ingestor supervisor and telemetry.
//! - **`ingestors`**: process launching and the per-process stream tasks.
//! - **`markets`**: the market status oracle and the Nasdaq source.
//! - **`loggers`**: `tracing` setup, runtime level reload, bus logging.
//! - **`retrieve`** (feature `nasdaq`): the retrying HTTP client.

#![forbid(unsafe_code)]

pub mod configs;
pub mod core;
pub mod ingestors;
pub mod loggers;
pub mod markets;
#[cfg(feature = "nasdaq")]
pub mod retrieve;
pub mod sysbus;

pub use configs::{ConfigManager, EngineConfig};
pub use sysbus::{EventBus, SysEvent};
