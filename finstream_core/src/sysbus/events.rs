//! # Control-Plane Vocabulary
//!
//! The closed set of messages carried by the [`EventBus`](super::EventBus) and the
//! small value types they are built from. Everything here is plain data: cloned per
//! subscriber, never mutated after construction.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Trading session reported by the market-status oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketState {
    /// Pre-market session (04:00-09:30 New York).
    PreMarket,
    /// Regular session.
    Open,
    /// After-hours session (16:00-20:00 New York).
    AfterHours,
    /// No session at all.
    Closed,
}

impl MarketState {
    /// Whether ingestors that follow market hours may run in this state.
    pub fn allows_ingestion(self) -> bool {
        !matches!(self, MarketState::Closed)
    }

    /// Maps the Nasdaq `mrktStatus` wording onto a state.
    ///
    /// Unknown wording yields `None` so callers can keep their last known state.
    pub fn from_nasdaq(status: &str) -> Option<Self> {
        let normalized: String = status
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "open" => Some(MarketState::Open),
            "closed" => Some(MarketState::Closed),
            "premarket" => Some(MarketState::PreMarket),
            "afterhours" => Some(MarketState::AfterHours),
            _ => None,
        }
    }
}

impl fmt::Display for MarketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MarketState::PreMarket => "PreMarket",
            MarketState::Open => "Open",
            MarketState::AfterHours => "AfterHours",
            MarketState::Closed => "Closed",
        };
        f.write_str(label)
    }
}

/// Lifecycle state of one supervised asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetState {
    Idle,
    Launching,
    Running,
    Draining,
    Terminated,
    Restarting,
    Failed,
}

impl AssetState {
    /// States in which a process exists (or is being created) for the asset.
    pub fn has_process(self) -> bool {
        matches!(
            self,
            AssetState::Launching | AssetState::Running | AssetState::Draining
        )
    }
}

impl fmt::Display for AssetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why an asset changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitionReason {
    Subscribed,
    Unsubscribed,
    MarketOpened,
    MarketClosed,
    AdminPause,
    AdminStart,
    AdminReboot,
    ConfigReloaded,
    AssetRemoved,
    ConfigChanged,
    ProcessExited,
    SpawnFailed,
    RestartBackoffElapsed,
    RestartLimitExceeded,
    BackpressureOverflow,
    GracePeriodElapsed,
    Shutdown,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Administrative commands accepted from the edge.
///
/// `asset: None` targets every known asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum ServerCommand {
    /// Drain the asset(s) and keep them down until started again.
    Pause {
        #[serde(default)]
        asset: Option<String>,
    },
    /// Clear pause/failure state and pin the asset(s) running.
    Start {
        #[serde(default)]
        asset: Option<String>,
    },
    /// Drain and relaunch the asset(s).
    Reboot {
        #[serde(default)]
        asset: Option<String>,
    },
    /// Switch the market oracle to simulated mode, holding `state`.
    SimulateMarket { state: MarketState },
    /// Switch the market oracle back to live polling.
    LiveMarket,
    /// Re-read the configuration file.
    ReloadConfig,
}

/// # System Event
///
/// Every message that travels on the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SysEvent {
    /// A new configuration generation became active.
    ConfigReloaded { generation: u64 },
    /// The oracle observed a market state change.
    MarketStatus(MarketState),
    /// An asset moved to `state`.
    AssetTransition {
        id: String,
        state: AssetState,
        reason: Option<TransitionReason>,
    },
    /// Periodic engine snapshot, already serialized off the data path.
    TelemetryTick(serde_json::Value),
    /// Operator command.
    ServerControl(ServerCommand),
}

impl SysEvent {
    /// Short variant name, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            SysEvent::ConfigReloaded { .. } => "ConfigReloaded",
            SysEvent::MarketStatus(_) => "MarketStatus",
            SysEvent::AssetTransition { .. } => "AssetTransition",
            SysEvent::TelemetryTick(_) => "TelemetryTick",
            SysEvent::ServerControl(_) => "ServerControl",
        }
    }
}
