//! # Telemetry
//!
//! Periodically gathers the engine's published snapshots into one
//! [`TelemetrySnapshot`] and announces it on the bus as `TelemetryTick`.
//!
//! Everything read here is already a snapshot (`watch` values, atomics), so a
//! telemetry pass never waits on the Supervisor, the Arena or an ingestor.
//! JSON serialization runs on the blocking pool to keep it off the async
//! workers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::arena::{ArenaHandle, RankingSnapshot};
use super::dispatcher::Dispatcher;
use super::supervisor::{AssetView, SupervisorHandle};
use crate::sysbus::{EventBus, MarketState, SysEvent};

/// One telemetry report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub at: DateTime<Utc>,
    /// `None` until the oracle has produced a first reading.
    pub market: Option<MarketState>,
    pub ranking: RankingSnapshot,
    pub degraded_count: usize,
    pub assets: Vec<AssetView>,
    /// Number of assets per lifecycle state.
    pub states: BTreeMap<String, usize>,
    pub bus_dropped: u64,
    pub clients: usize,
    pub ticks_delivered: u64,
}

/// # Telemetry
pub struct Telemetry {
    arena: ArenaHandle,
    supervisor: SupervisorHandle,
    dispatcher: Arc<Dispatcher>,
    market: watch::Receiver<Option<MarketState>>,
    bus: EventBus,
    interval: Duration,
}

impl Telemetry {
    pub fn new(
        arena: ArenaHandle,
        supervisor: SupervisorHandle,
        dispatcher: Arc<Dispatcher>,
        market: watch::Receiver<Option<MarketState>>,
        bus: EventBus,
        interval: Duration,
    ) -> Self {
        Self {
            arena,
            supervisor,
            dispatcher,
            market,
            bus,
            interval,
        }
    }

    /// Assembles a report from the latest published snapshots.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let ranking = self.arena.latest();
        let assets: Vec<AssetView> = self.supervisor.assets().values().cloned().collect();
        let mut states = BTreeMap::new();
        for view in &assets {
            *states.entry(view.state.to_string()).or_insert(0) += 1;
        }
        TelemetrySnapshot {
            at: Utc::now(),
            market: *self.market.borrow(),
            degraded_count: ranking.degraded_count,
            ranking: ranking.as_ref().clone(),
            assets,
            states,
            bus_dropped: self.bus.dropped_total(),
            clients: self.dispatcher.client_count(),
            ticks_delivered: self.dispatcher.delivered(),
        }
    }

    /// Publishes a report every interval until `shutdown`.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes at once.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let snapshot = self.snapshot();
            match tokio::task::spawn_blocking(move || serde_json::to_value(&snapshot)).await {
                Ok(Ok(value)) => {
                    self.bus.publish(SysEvent::TelemetryTick(value));
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "failed to serialize telemetry"),
                Err(e) => tracing::warn!(error = %e, "telemetry serialization task failed"),
            }
        }
        tracing::debug!("telemetry stopped");
    }
}
