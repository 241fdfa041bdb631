//! # Ingestor Processes Module
//!
//! Ingestors are external processes that print one JSON record per line on
//! stdout. This module owns everything between the OS process and the parsed
//! tick stream.
//!
//! ## Contained Modules:
//! - **`process`**: the launcher capability (`ProcessLauncher`, `IngestorChild`)
//!   and its `tokio::process` implementation.
//! - **`stream`**: the per-process reader, pipeline, stderr and waiter tasks,
//!   including the high-water clock fed to the backpressure policy.

/// Process launching and signalling.
pub mod process;
/// Per-process stream tasks.
pub mod stream;

pub use process::{IngestorChild, ProcessExit, ProcessLauncher, TokioLauncher};
pub use stream::{HighWaterClock, StreamStats};
