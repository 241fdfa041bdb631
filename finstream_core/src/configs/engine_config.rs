//! # Engine Configuration
//!
//! The JSON document that drives the engine: which ingestors exist and how
//! supervision, backpressure, market-status polling and logging behave. Keys are
//! camelCase; every section has defaults so a file may name only its assets.
//!
//! A configuration is validated in full before it is accepted. An invalid file
//! never replaces the active one.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::backpressure::{BackpressurePolicy, PolicyError};
use crate::sysbus::events::MarketState;

/// Why a configuration was rejected.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("asset at position {0} has an empty id")]
    EmptyAssetId(usize),
    #[error("asset id {0:?} is defined more than once")]
    DuplicateAssetId(String),
    #[error("asset {0:?} has an empty command")]
    EmptyCommand(String),
    #[error("invalid backpressure settings: {0}")]
    Backpressure(#[from] PolicyError),
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("restart.baseBackoffMs ({base}) exceeds restart.maxBackoffMs ({max})")]
    BackoffOrder { base: u64, max: u64 },
    #[error("unknown reference timezone {0:?}")]
    UnknownTimezone(String),
    #[error("invalid log level directive {directive:?}: {reason}")]
    LogLevel { directive: String, reason: String },
    #[error("no configuration file to reload from")]
    NoSource,
}

/// What an ingestor produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    #[default]
    Pricing,
    Sentiment,
    Other,
}

/// How to run the ingestor for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDefinition {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub kind: AssetKind,
    /// Extra environment variables for the process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Paused while the market is closed.
    #[serde(default = "default_true")]
    pub follows_market_hours: bool,
    /// Runs without any subscriber.
    #[serde(default)]
    pub autostart: bool,
}

impl AssetDefinition {
    /// A pricing asset with default flags.
    pub fn new(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            args,
            kind: AssetKind::Pricing,
            env: BTreeMap::new(),
            follows_market_hours: true,
            autostart: false,
        }
    }

    /// Whether switching from `self` to `other` requires restarting the process.
    pub fn launch_differs(&self, other: &AssetDefinition) -> bool {
        self.command != other.command || self.args != other.args || self.env != other.env
    }
}

/// Crash-restart limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestartConfig {
    pub max_restarts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// A process that ran at least this long before crashing starts a fresh
    /// restart budget.
    pub stable_after_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            stable_after_ms: 60_000,
        }
    }
}

impl RestartConfig {
    /// Delay before restart number `attempt` (1-based): `min(base * 2^(attempt-1), max)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let ms = self
            .base_backoff_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }
}

/// Output-queue thresholds for every ingestor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackpressureConfig {
    pub capacity: usize,
    pub high_water: usize,
    pub sustained_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            high_water: 768,
            sustained_ms: 2_000,
        }
    }
}

impl BackpressureConfig {
    pub fn policy(&self) -> Result<BackpressurePolicy, PolicyError> {
        BackpressurePolicy::new(
            self.capacity,
            self.high_water,
            Duration::from_millis(self.sustained_ms),
        )
    }
}

/// Where the oracle gets market status from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OracleMode {
    #[default]
    Live,
    Simulated,
}

/// Market status oracle settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MarketStatusConfig {
    pub mode: OracleMode,
    /// State held in simulated mode.
    pub simulated_state: MarketState,
    pub active_interval_secs: u64,
    pub closed_interval_secs: u64,
    pub retry_interval_secs: u64,
}

impl Default for MarketStatusConfig {
    fn default() -> Self {
        Self {
            mode: OracleMode::Live,
            simulated_state: MarketState::Open,
            active_interval_secs: 60,
            closed_interval_secs: 900,
            retry_interval_secs: 30,
        }
    }
}

/// # Engine Configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub assets: Vec<AssetDefinition>,
    pub grace_period_ms: u64,
    pub restart: RestartConfig,
    pub backpressure: BackpressureConfig,
    pub market_status: MarketStatusConfig,
    pub reference_timezone: String,
    pub bus_capacity: usize,
    pub client_queue_capacity: usize,
    pub telemetry_interval_secs: u64,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            assets: Vec::new(),
            grace_period_ms: 3_000,
            restart: RestartConfig::default(),
            backpressure: BackpressureConfig::default(),
            market_status: MarketStatusConfig::default(),
            reference_timezone: "America/New_York".to_string(),
            bus_capacity: 1024,
            client_queue_capacity: 256,
            telemetry_interval_secs: 5,
            log_level: "info".to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    /// Reads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every constraint; the first violation is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for (position, asset) in self.assets.iter().enumerate() {
            if asset.id.trim().is_empty() {
                return Err(ConfigError::EmptyAssetId(position));
            }
            if !seen.insert(asset.id.as_str()) {
                return Err(ConfigError::DuplicateAssetId(asset.id.clone()));
            }
            if asset.command.trim().is_empty() {
                return Err(ConfigError::EmptyCommand(asset.id.clone()));
            }
        }

        self.backpressure.policy()?;

        let positives = [
            ("gracePeriodMs", self.grace_period_ms),
            ("restart.maxBackoffMs", self.restart.max_backoff_ms),
            ("marketStatus.activeIntervalSecs", self.market_status.active_interval_secs),
            ("marketStatus.closedIntervalSecs", self.market_status.closed_interval_secs),
            ("marketStatus.retryIntervalSecs", self.market_status.retry_interval_secs),
            ("busCapacity", self.bus_capacity as u64),
            ("clientQueueCapacity", self.client_queue_capacity as u64),
            ("telemetryIntervalSecs", self.telemetry_interval_secs),
        ];
        for (name, value) in positives {
            if value == 0 {
                return Err(ConfigError::ZeroValue(name));
            }
        }
        if self.restart.base_backoff_ms > self.restart.max_backoff_ms {
            return Err(ConfigError::BackoffOrder {
                base: self.restart.base_backoff_ms,
                max: self.restart.max_backoff_ms,
            });
        }

        self.reference_tz()?;

        tracing_subscriber::EnvFilter::try_new(&self.log_level).map_err(|e| ConfigError::LogLevel {
            directive: self.log_level.clone(),
            reason: e.to_string(),
        })?;

        Ok(())
    }

    pub fn reference_tz(&self) -> Result<Tz, ConfigError> {
        self.reference_timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::UnknownTimezone(self.reference_timezone.clone()))
    }

    pub fn asset(&self, id: &str) -> Option<&AssetDefinition> {
        self.assets.iter().find(|a| a.id == id)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs)
    }
}
