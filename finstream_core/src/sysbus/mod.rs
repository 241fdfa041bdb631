//! # System Bus
//!
//! The control plane of the engine. Market status changes, configuration
//! generations, asset lifecycle transitions, telemetry and operator commands all
//! travel here as [`SysEvent`]s.
//!
//! The bus is deliberately lossy: a publisher never waits on a slow subscriber.
//! Market data never travels on it; ticks go through the ingestor pipelines and
//! the fan-out dispatcher instead.
//!
//! ## Contained Modules:
//!
//! - **`events`**: the event enum and the small state types it carries.
//! - **`bus`**: the drop-on-full publish/subscribe channel.

/// Drop-on-full publish/subscribe channel.
pub mod bus;
/// Control-plane event vocabulary.
pub mod events;

pub use bus::{BusReceiver, EventBus, EventFilter, DEFAULT_BUS_CAPACITY};
pub use events::{AssetState, MarketState, ServerCommand, SysEvent, TransitionReason};
