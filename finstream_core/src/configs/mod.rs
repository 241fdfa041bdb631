//! # Configuration Modules
//!
//! Loading, validation and hot reloading of the engine configuration.
//!
//! - **`config_sys`**: where the configuration file lives.
//! - **`engine_config`**: the configuration document and its validation rules.
//! - **`manager`**: the atomically swapped active configuration and reload handling.

/// Resolves the configuration file path.
pub mod config_sys;

/// Engine configuration document.
pub mod engine_config;

/// Active configuration holder and reload loop.
pub mod manager;

pub use config_sys::resolve_config_path;
pub use engine_config::{
    AssetDefinition, AssetKind, BackpressureConfig, ConfigError, EngineConfig, MarketStatusConfig,
    OracleMode, RestartConfig,
};
pub use manager::ConfigManager;
