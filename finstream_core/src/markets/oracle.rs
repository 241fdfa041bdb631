//! # Market Status Oracle
//!
//! Answers one question for the rest of the engine: is the market trading?
//!
//! ## Modes
//!
//! - **Live**: polls a [`StatusSource`]. While the market allows ingestion the
//!   poll interval is `activeIntervalSecs`. While closed it is
//!   `closedIntervalSecs`, shortened to the time left until the next open but
//!   never below the active interval. A failed poll keeps the last known state,
//!   publishes nothing and retries after `retryIntervalSecs`.
//! - **Simulated**: no polling. The state is whatever the last
//!   `SimulateMarket` command said.
//!
//! Modes switch only on `ServerControl(SimulateMarket)` and
//! `ServerControl(LiveMarket)`. `MarketStatus` is published on the bus only
//! when the state actually changes; the current state is always readable from
//! the `watch` receiver returned by [`MarketOracle::new`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::configs::{ConfigManager, MarketStatusConfig, OracleMode};
use crate::sysbus::{BusReceiver, EventBus, MarketState, ServerCommand, SysEvent};

#[cfg(feature = "nasdaq")]
use crate::retrieve::ky_http::ApiError;

#[derive(Debug, Error)]
pub enum OracleError {
    #[cfg(feature = "nasdaq")]
    #[error("market status request failed: {0}")]
    Api(#[from] ApiError),
    #[error("malformed market status payload: {0}")]
    Payload(#[source] serde_json::Error),
    #[error("unrecognized market status {0:?}")]
    UnknownStatus(String),
    #[error("market status source unavailable: {0}")]
    Unavailable(String),
}

/// One successful reading of the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketReading {
    pub state: MarketState,
    /// Time until the next session opens, when closed and known.
    pub next_open_in: Option<Duration>,
}

impl MarketReading {
    pub fn new(state: MarketState) -> Self {
        Self {
            state,
            next_open_in: None,
        }
    }
}

/// Where live market status comes from.
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    async fn fetch(&self) -> Result<MarketReading, OracleError>;
}

/// Delay before the next live poll after `reading`.
pub fn next_poll_delay(settings: &MarketStatusConfig, reading: &MarketReading) -> Duration {
    let active = Duration::from_secs(settings.active_interval_secs);
    if reading.state.allows_ingestion() {
        return active;
    }
    let closed = Duration::from_secs(settings.closed_interval_secs);
    let delay = match reading.next_open_in {
        Some(until_open) => closed.min(until_open),
        None => closed,
    };
    delay.max(active)
}

/// # Market Status Oracle
pub struct MarketOracle {
    source: Arc<dyn StatusSource>,
    configs: Arc<ConfigManager>,
    bus: EventBus,
    events: BusReceiver,
    state: watch::Sender<Option<MarketState>>,
    mode: OracleMode,
}

impl MarketOracle {
    /// Builds the oracle in the mode named by the active configuration. The
    /// receiver holds `None` until a first state is known.
    pub fn new(
        source: Arc<dyn StatusSource>,
        configs: Arc<ConfigManager>,
        bus: EventBus,
    ) -> (Self, watch::Receiver<Option<MarketState>>) {
        let (state, state_rx) = watch::channel(None);
        let events = bus.subscribe_filtered("market-oracle", |event| matches!(event, SysEvent::ServerControl(_)));
        let mode = configs.current().market_status.mode;
        let oracle = Self {
            source,
            configs,
            bus,
            events,
            state,
            mode,
        };
        (oracle, state_rx)
    }

    pub fn mode(&self) -> OracleMode {
        self.mode
    }

    /// Runs until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(mode = ?self.mode, "market oracle started");
        if self.mode == OracleMode::Simulated {
            let simulated = self.configs.current().market_status.simulated_state;
            self.set_state(simulated);
        }

        let mut next_poll = Instant::now();
        loop {
            let live = self.mode == OracleMode::Live;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(SysEvent::ServerControl(command)) => {
                        if self.on_command(command) {
                            next_poll = Instant::now();
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = tokio::time::sleep_until(next_poll), if live => {
                    let result = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        result = self.source.fetch() => result,
                    };
                    next_poll = Instant::now() + self.on_reading(result);
                }
            }
        }
        tracing::debug!("market oracle stopped");
    }

    /// Applies an operator command; returns `true` when live polling must
    /// start right away.
    fn on_command(&mut self, command: ServerCommand) -> bool {
        match command {
            ServerCommand::SimulateMarket { state } => {
                tracing::info!(%state, "market oracle switched to simulated mode");
                self.mode = OracleMode::Simulated;
                self.set_state(state);
                false
            }
            ServerCommand::LiveMarket => {
                let was_live = self.mode == OracleMode::Live;
                self.mode = OracleMode::Live;
                if !was_live {
                    tracing::info!("market oracle switched to live mode");
                }
                !was_live
            }
            _ => false,
        }
    }

    fn on_reading(&self, result: Result<MarketReading, OracleError>) -> Duration {
        let settings = self.configs.current().market_status.clone();
        match result {
            Ok(reading) => {
                self.set_state(reading.state);
                next_poll_delay(&settings, &reading)
            }
            Err(e) => {
                let retry = Duration::from_secs(settings.retry_interval_secs);
                tracing::warn!(
                    error = %e,
                    last_known = ?*self.state.borrow(),
                    retry_secs = retry.as_secs(),
                    "market status poll failed, keeping last known state"
                );
                retry
            }
        }
    }

    /// Stores `state`, publishing `MarketStatus` if it differs from the last one.
    fn set_state(&self, state: MarketState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == Some(state) {
                false
            } else {
                *current = Some(state);
                true
            }
        });
        if changed {
            tracing::info!(%state, "market status changed");
            self.bus.publish(SysEvent::MarketStatus(state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::EngineConfig;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays scripted readings and records when each poll happened.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<MarketReading, OracleError>>>,
        polls: Mutex<Vec<Instant>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<MarketReading, OracleError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                polls: Mutex::new(Vec::new()),
            })
        }

        fn polls(&self) -> Vec<Instant> {
            self.polls.lock().clone()
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        async fn fetch(&self) -> Result<MarketReading, OracleError> {
            self.polls.lock().push(Instant::now());
            self.script
                .lock()
                .pop_front()
                .unwrap_or(Err(OracleError::Unavailable("script exhausted".into())))
        }
    }

    fn manager(mode: OracleMode, bus: &EventBus) -> Arc<ConfigManager> {
        let mut config = EngineConfig::default();
        config.market_status.mode = mode;
        config.market_status.simulated_state = MarketState::Closed;
        ConfigManager::new(config, None, bus.clone()).unwrap()
    }

    async fn next_market_event(rx: &mut BusReceiver) -> MarketState {
        loop {
            match rx.recv().await {
                Some(SysEvent::MarketStatus(state)) => return state,
                Some(_) => continue,
                None => panic!("bus closed"),
            }
        }
    }

    #[test]
    fn test_poll_delay_follows_market_state() {
        let settings = MarketStatusConfig::default();
        let open = MarketReading::new(MarketState::Open);
        assert_eq!(next_poll_delay(&settings, &open), Duration::from_secs(60));

        let closed = MarketReading::new(MarketState::Closed);
        assert_eq!(next_poll_delay(&settings, &closed), Duration::from_secs(900));

        let opening_soon = MarketReading {
            state: MarketState::Closed,
            next_open_in: Some(Duration::from_secs(120)),
        };
        assert_eq!(next_poll_delay(&settings, &opening_soon), Duration::from_secs(120));

        let opening_now = MarketReading {
            state: MarketState::Closed,
            next_open_in: Some(Duration::from_secs(5)),
        };
        assert_eq!(next_poll_delay(&settings, &opening_now), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_only_on_change_and_masks_failures() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe("test");
        let source = ScriptedSource::new(vec![
            Ok(MarketReading::new(MarketState::Open)),
            Ok(MarketReading::new(MarketState::Open)),
            Err(OracleError::Unavailable("timeout".into())),
            Ok(MarketReading::new(MarketState::AfterHours)),
        ]);
        let (oracle, state) = MarketOracle::new(source.clone(), manager(OracleMode::Live, &bus), bus.clone());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(oracle.run(shutdown.clone()));

        assert_eq!(next_market_event(&mut rx).await, MarketState::Open);
        assert_eq!(next_market_event(&mut rx).await, MarketState::AfterHours);
        assert_eq!(*state.borrow(), Some(MarketState::AfterHours));

        let polls = source.polls();
        assert_eq!(polls.len(), 4);
        assert_eq!((polls[1] - polls[0]).as_secs(), 60);
        assert_eq!((polls[2] - polls[1]).as_secs(), 60);
        // The failure is retried on the shorter retry interval.
        assert_eq!((polls[3] - polls[2]).as_secs(), 30);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_mode_holds_state_until_live() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe("test");
        let source = ScriptedSource::new(vec![Ok(MarketReading::new(MarketState::Open))]);
        let (oracle, state) =
            MarketOracle::new(source.clone(), manager(OracleMode::Simulated, &bus), bus.clone());
        assert_eq!(oracle.mode(), OracleMode::Simulated);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(oracle.run(shutdown.clone()));

        assert_eq!(next_market_event(&mut rx).await, MarketState::Closed);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(source.polls().is_empty());

        bus.publish(SysEvent::ServerControl(ServerCommand::SimulateMarket {
            state: MarketState::PreMarket,
        }));
        assert_eq!(next_market_event(&mut rx).await, MarketState::PreMarket);

        bus.publish(SysEvent::ServerControl(ServerCommand::LiveMarket));
        assert_eq!(next_market_event(&mut rx).await, MarketState::Open);
        assert_eq!(source.polls().len(), 1);
        assert_eq!(*state.borrow(), Some(MarketState::Open));

        shutdown.cancel();
        task.await.unwrap();
    }
}
