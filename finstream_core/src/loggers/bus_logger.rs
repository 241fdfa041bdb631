//! Writes every control-plane event to the log and keeps the log filter in
//! step with the configuration.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::configs::ConfigManager;
use crate::sysbus::{EventBus, SysEvent};

/// Logs bus events until `shutdown`. On `ConfigReloaded` the configured
/// `logLevel` is applied when it changed.
pub async fn run_bus_logger(bus: EventBus, configs: Arc<ConfigManager>, shutdown: CancellationToken) {
    let mut events = bus.subscribe("logger");
    let mut level = configs.current().log_level.clone();

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match &event {
            SysEvent::ConfigReloaded { generation } => {
                tracing::info!(target: "sysbus", kind = event.kind(), generation, "config reloaded");
                let configured = configs.current().log_level.clone();
                if configured != level {
                    match super::set_log_level(&configured) {
                        Ok(()) => level = configured,
                        Err(e) => tracing::warn!(error = %e, "log level from reloaded config not applied"),
                    }
                }
            }
            SysEvent::MarketStatus(state) => {
                tracing::info!(target: "sysbus", kind = event.kind(), %state, "market status");
            }
            SysEvent::AssetTransition { id, state, reason } => {
                tracing::debug!(target: "sysbus", kind = event.kind(), asset = %id, %state, ?reason, "asset transition");
            }
            SysEvent::TelemetryTick(payload) => {
                tracing::trace!(target: "sysbus", kind = event.kind(), %payload, "telemetry");
            }
            SysEvent::ServerControl(command) => {
                tracing::info!(target: "sysbus", kind = event.kind(), ?command, "server control");
            }
        }
    }
    if events.dropped() > 0 {
        tracing::warn!(subscriber = events.name(), dropped = events.dropped(), "bus logger missed events");
    }
}
