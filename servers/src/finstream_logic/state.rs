use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use finstream_core::core::{ArenaHandle, Dispatcher, SupervisorHandle};
use finstream_core::sysbus::{EventBus, MarketState};

/// # Application State
///
/// Everything the edge routes read from or write to. Cloned into every
/// handler; all fields are cheap handles onto the running engine.
#[derive(Clone)]
pub struct AppState {
    /// Tick fan-out to WebSocket sessions.
    pub dispatcher: Arc<Dispatcher>,
    /// Asset views and subscriber registration.
    pub supervisor: SupervisorHandle,
    /// Freshness ranking.
    pub arena: ArenaHandle,
    /// Last state observed by the market oracle.
    pub market: watch::Receiver<Option<MarketState>>,
    /// Control plane, for operator commands.
    pub bus: EventBus,
    /// Fired when the process shuts down; sessions close on it.
    pub shutdown: CancellationToken,
}
