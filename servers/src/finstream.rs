//! # FinStream Server
//!
//! Runs the FinStream engine behind an HTTP/WebSocket edge.
//!
//! ## Core Responsibilities:
//! - **Engine Wiring:** builds the control-plane bus, configuration manager,
//!   arena, ingestor supervisor, fan-out dispatcher, market oracle, telemetry
//!   and bus logger, and runs each as its own task.
//! - **Client Edge:** serves `/health`, `/ranking`, `/assets`, `/market`,
//!   `/admin` and `/ws` (see `finstream_logic::edge`).
//! - **Lifecycle:** Ctrl-C or SIGTERM cancels one token shared by every task;
//!   the supervisor then drains its ingestors before the process exits.

#![forbid(unsafe_code)]

mod finstream_logic;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use static_init::dynamic;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use finstream_core::configs::{resolve_config_path, ConfigManager, EngineConfig};
use finstream_core::core::{ArenaService, Dispatcher, Supervisor, Telemetry};
use finstream_core::ingestors::{ProcessLauncher, TokioLauncher};
use finstream_core::loggers::{init_logging, run_bus_logger};
use finstream_core::markets::nasdaq::NasdaqStatusSource;
use finstream_core::markets::{MarketOracle, StatusSource};
use finstream_core::sysbus::EventBus;

use finstream_logic::config::Config;
use finstream_logic::edge;
use finstream_logic::state::AppState;

#[dynamic]
static DOTENV_INIT: () = {
    dotenvy::dotenv().ok();
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = &*DOTENV_INIT;

    // --- Phase 1: Configuration ---
    let cli = Config::parse();
    let config_path = resolve_config_path(cli.config.as_deref())?;
    let engine_config = EngineConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    // --- Phase 2: Logging ---
    // The guard flushes the file writer on drop; hold it until main returns.
    let _log_guard = init_logging(&cli.log_dir, cli.effective_log_level(&engine_config.log_level))?;
    tracing::info!(config = %config_path.display(), assets = engine_config.assets.len(), "starting finstream");

    // --- Phase 3: Control Plane ---
    let shutdown = CancellationToken::new();
    let bus = EventBus::new(engine_config.bus_capacity);
    let queue_capacity = engine_config.client_queue_capacity;
    let telemetry_interval = engine_config.telemetry_interval();
    let reference_tz = engine_config.reference_tz()?;
    let configs = ConfigManager::new(engine_config, Some(config_path), bus.clone())?;
    let config_task = configs.spawn(shutdown.clone());
    tokio::spawn(run_bus_logger(bus.clone(), Arc::clone(&configs), shutdown.clone()));

    // --- Phase 4: Data Plane ---
    let (arena_service, arena) = ArenaService::new();
    tokio::spawn(arena_service.run(shutdown.clone()));

    let launcher: Arc<dyn ProcessLauncher> = Arc::new(TokioLauncher);
    let (supervisor, supervisor_handle) =
        Supervisor::new(Arc::clone(&configs), launcher, arena.clone(), bus.clone())?;
    let dispatcher = Dispatcher::new(supervisor_handle.clone(), queue_capacity);
    let supervisor_task = tokio::spawn(supervisor.run(dispatcher.clone(), shutdown.clone()));

    // --- Phase 5: Market Oracle & Telemetry ---
    let source: Arc<dyn StatusSource> = Arc::new(NasdaqStatusSource::new(reference_tz)?);
    let (oracle, market) = MarketOracle::new(source, Arc::clone(&configs), bus.clone());
    tokio::spawn(oracle.run(shutdown.clone()));

    let telemetry = Telemetry::new(
        arena.clone(),
        supervisor_handle.clone(),
        dispatcher.clone(),
        market.clone(),
        bus.clone(),
        telemetry_interval,
    );
    tokio::spawn(telemetry.run(shutdown.clone()));

    // --- Phase 6: Signals ---
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        signal_token.cancel();
    });

    // --- Phase 7: Edge ---
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "edge listening");

    let state = AppState {
        dispatcher,
        supervisor: supervisor_handle,
        arena,
        market,
        bus,
        shutdown: shutdown.clone(),
    };
    if let Err(e) = edge::serve(listener, state).await {
        tracing::error!(error = %e, "edge server failed");
        shutdown.cancel();
    }

    // --- Phase 8: Drain ---
    if let Err(e) = supervisor_task.await {
        tracing::error!(error = %e, "supervisor task failed");
    }
    let _ = config_task.await;
    tracing::info!("finstream stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
