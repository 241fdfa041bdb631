//! # Config Manager
//!
//! Holds the active [`EngineConfig`] behind a `parking_lot::RwLock<Arc<_>>`.
//! Readers clone the `Arc` and keep one consistent version for as long as they
//! need it; a reload swaps the pointer in one step. Every accepted configuration
//! bumps the generation and is announced on the bus as `ConfigReloaded`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::engine_config::{ConfigError, EngineConfig};
use crate::sysbus::{EventBus, ServerCommand, SysEvent};

/// # Config Manager
pub struct ConfigManager {
    path: Option<PathBuf>,
    current: RwLock<Arc<EngineConfig>>,
    generation: AtomicU64,
    bus: EventBus,
}

impl ConfigManager {
    /// Wraps an initial configuration as generation 1. `path`, when given, is
    /// where [`reload`](Self::reload) reads from.
    pub fn new(initial: EngineConfig, path: Option<PathBuf>, bus: EventBus) -> Result<Arc<Self>, ConfigError> {
        initial.validate()?;
        Ok(Arc::new(Self {
            path,
            current: RwLock::new(Arc::new(initial)),
            generation: AtomicU64::new(1),
            bus,
        }))
    }

    /// Loads the initial configuration from `path`.
    pub fn load(path: &Path, bus: EventBus) -> Result<Arc<Self>, ConfigError> {
        let config = EngineConfig::load(path)?;
        Self::new(config, Some(path.to_path_buf()), bus)
    }

    /// The active configuration.
    pub fn current(&self) -> Arc<EngineConfig> {
        self.current.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-reads the configuration file and applies it.
    pub fn reload(&self) -> Result<u64, ConfigError> {
        let path = self.path.as_deref().ok_or(ConfigError::NoSource)?;
        let config = EngineConfig::load(path)?;
        self.apply(config)
    }

    /// Validates and activates `config`; returns the new generation.
    ///
    /// On error the active configuration is left untouched.
    pub fn apply(&self, config: EngineConfig) -> Result<u64, ConfigError> {
        config.validate()?;
        let assets = config.assets.len();
        let generation = {
            let mut current = self.current.write();
            *current = Arc::new(config);
            self.generation.fetch_add(1, Ordering::AcqRel) + 1
        };
        tracing::info!(generation, assets, "configuration applied");
        self.bus.publish(SysEvent::ConfigReloaded { generation });
        Ok(generation)
    }

    /// Subscribes to the bus and serves `ReloadConfig` commands until `shutdown`.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut events = self
            .bus
            .subscribe_filtered("config-manager", |event| matches!(event, SysEvent::ServerControl(_)));
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Some(SysEvent::ServerControl(ServerCommand::ReloadConfig)) => {
                        if let Err(e) = manager.reload() {
                            tracing::error!(error = %e, "configuration reload rejected, keeping active config");
                        }
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            tracing::debug!("config manager stopped");
        })
    }
}
