//! # Ingestor Supervisor
//!
//! The supervisor decides which ingestor processes run. It is a single task that
//! owns every asset's lifecycle state; everything else talks to it by message:
//!
//! - the fan-out dispatcher registers and releases subscriber demand through a
//!   [`SupervisorHandle`] (reliable channel);
//! - per-process tasks report exits and backpressure overflows (reliable channel);
//! - the market oracle, the config manager and operators reach it over the
//!   lossy [`EventBus`].
//!
//! ## Asset Lifecycle
//!
//! ```text
//! Idle -> Launching -> Running -> Draining -> Terminated -> (Launching | Idle)
//!                      Running -> Restarting -> Launching
//!                                 Restarting -> Failed
//! ```
//!
//! An asset wants to run when it is defined, not paused by an operator, not
//! failed, not held after an overflow, allowed by the market (or indifferent to
//! market hours), and has demand: subscribers, `autostart`, or an operator pin.
//! Every state change is published once as `AssetTransition`.
//!
//! Draining sends SIGTERM and arms the grace timer; a process still alive when
//! it fires is killed. A backpressure overflow skips the grace period, kills the
//! process at once and holds the asset `Terminated` until a fresh trigger (new
//! subscriber, operator start or reboot, config reload). The hold ends early,
//! with the asset going `Idle`, once no demand is left.
//!
//! A crash after `restart.stableAfterMs` of uptime starts a fresh restart
//! budget; only crash loops reach `Failed`.
//!
//! Each launch gets a new generation number. Messages carrying an older
//! generation belong to a previous incarnation and are ignored.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::arena::ArenaHandle;
use super::backpressure::{BackpressurePolicy, KillReason, PolicyError};
use super::dispatcher::{DiscardSink, TickSink};
use crate::configs::{AssetDefinition, AssetKind, ConfigError, ConfigManager, EngineConfig};
use crate::ingestors::process::{IngestorChild, ProcessExit, ProcessLauncher};
use crate::ingestors::stream::{self, ChildControl, ReaderOutcome, StreamStats};
use crate::sysbus::{
    AssetState, BusReceiver, EventBus, MarketState, ServerCommand, SysEvent, TransitionReason,
};

/// How often asset views are republished when nothing else happens.
const VIEW_REFRESH: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid backpressure settings: {0}")]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Read-only view of one asset, published after every handled message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetView {
    pub id: String,
    pub state: AssetState,
    /// `None` while subscribers wait for an asset the config does not define.
    pub kind: Option<AssetKind>,
    pub subscribers: usize,
    pub restart_count: u32,
    pub generation: u64,
    pub pid: Option<u32>,
    pub launched_at: Option<DateTime<Utc>>,
    pub queue_depth: usize,
    pub ticks: u64,
    pub malformed_lines: u64,
    pub last_reason: Option<TransitionReason>,
    pub admin_paused: bool,
    pub overflow_hold: bool,
    pub paused_by_market: bool,
}

/// Shared snapshot of all asset views, keyed by asset id.
pub type AssetViews = Arc<BTreeMap<String, AssetView>>;

enum SupervisorMsg {
    Register(String),
    Unregister(String),
    Exited {
        asset: String,
        generation: u64,
        result: io::Result<ProcessExit>,
    },
    Overflow {
        asset: String,
        generation: u64,
        reason: KillReason,
    },
    GraceElapsed { asset: String, generation: u64 },
    RestartDue { asset: String, generation: u64 },
}

/// Cloneable front of a running [`Supervisor`].
#[derive(Clone)]
pub struct SupervisorHandle {
    inbox: mpsc::UnboundedSender<SupervisorMsg>,
    views: watch::Receiver<AssetViews>,
}

impl SupervisorHandle {
    /// Adds one subscriber to `asset`. The asset need not be defined yet.
    pub fn register_subscriber(&self, asset: &str) {
        let _ = self.inbox.send(SupervisorMsg::Register(asset.to_string()));
    }

    /// Removes one subscriber from `asset`.
    pub fn unregister_subscriber(&self, asset: &str) {
        let _ = self.inbox.send(SupervisorMsg::Unregister(asset.to_string()));
    }

    /// Latest published asset views.
    pub fn assets(&self) -> AssetViews {
        self.views.borrow().clone()
    }

    pub fn asset(&self, id: &str) -> Option<AssetView> {
        self.views.borrow().get(id).cloned()
    }

}

/// The live process behind a `Running` or `Draining` asset.
struct ProcessHandle {
    control: mpsc::UnboundedSender<ChildControl>,
    cancel: CancellationToken,
    pid: Option<u32>,
    launched_at: DateTime<Utc>,
    started: Instant,
    stats: Arc<StreamStats>,
    killed: bool,
}

impl ProcessHandle {
    fn terminate(&self) {
        let _ = self.control.send(ChildControl::Terminate);
    }

    fn kill(&mut self) {
        self.killed = true;
        self.cancel.cancel();
        let _ = self.control.send(ChildControl::Kill);
    }
}

struct AssetSlot {
    id: String,
    def: Option<AssetDefinition>,
    state: AssetState,
    last_reason: Option<TransitionReason>,
    subscribers: usize,
    restart_count: u32,
    generation: u64,
    admin_paused: bool,
    /// Started by an operator; runs without subscribers.
    pinned: bool,
    overflow_hold: bool,
    paused_by_market: bool,
    reboot_pending: bool,
    drain_reason: Option<TransitionReason>,
    grace_killed: bool,
    process: Option<ProcessHandle>,
}

impl AssetSlot {
    fn new(id: String, def: Option<AssetDefinition>) -> Self {
        Self {
            id,
            def,
            state: AssetState::Idle,
            last_reason: None,
            subscribers: 0,
            restart_count: 0,
            generation: 0,
            admin_paused: false,
            pinned: false,
            overflow_hold: false,
            paused_by_market: false,
            reboot_pending: false,
            drain_reason: None,
            grace_killed: false,
            process: None,
        }
    }

    /// Subscribers, `autostart` or an operator pin.
    fn has_demand(&self) -> bool {
        self.subscribers > 0 || self.pinned || self.def.as_ref().is_some_and(|d| d.autostart)
    }

    /// Nothing left worth remembering.
    fn is_disposable(&self) -> bool {
        self.state == AssetState::Idle
            && self.def.is_none()
            && self.subscribers == 0
            && self.process.is_none()
    }

    fn view(&self) -> AssetView {
        let process = self.process.as_ref();
        AssetView {
            id: self.id.clone(),
            state: self.state,
            kind: self.def.as_ref().map(|d| d.kind),
            subscribers: self.subscribers,
            restart_count: self.restart_count,
            generation: self.generation,
            pid: process.and_then(|p| p.pid),
            launched_at: process.map(|p| p.launched_at),
            queue_depth: process.map_or(0, |p| p.stats.depth()),
            ticks: process.map_or(0, |p| p.stats.ticks()),
            malformed_lines: process.map_or(0, |p| p.stats.malformed()),
            last_reason: self.last_reason,
            admin_paused: self.admin_paused,
            overflow_hold: self.overflow_hold,
            paused_by_market: self.paused_by_market,
        }
    }
}

/// Everything the lifecycle operations need besides the slot table.
struct Runtime {
    configs: Arc<ConfigManager>,
    config: Arc<EngineConfig>,
    config_generation: u64,
    policy: BackpressurePolicy,
    tz: Tz,
    launcher: Arc<dyn ProcessLauncher>,
    arena: ArenaHandle,
    bus: EventBus,
    sink: Arc<dyn TickSink>,
    inbox: mpsc::UnboundedSender<SupervisorMsg>,
    market: Option<MarketState>,
    next_generation: u64,
    shutting_down: bool,
}

impl Runtime {
    /// An unknown market state (no reading yet) allows ingestion.
    fn market_allows(&self) -> bool {
        self.market.map_or(true, MarketState::allows_ingestion)
    }

    fn wants_running(&self, slot: &AssetSlot) -> bool {
        let Some(def) = slot.def.as_ref() else {
            return false;
        };
        !self.shutting_down
            && !slot.admin_paused
            && !slot.overflow_hold
            && slot.state != AssetState::Failed
            && (self.market_allows() || !def.follows_market_hours)
            && slot.has_demand()
    }

    fn transition(&self, slot: &mut AssetSlot, state: AssetState, reason: TransitionReason) {
        let from = slot.state;
        slot.state = state;
        slot.last_reason = Some(reason);
        tracing::info!(
            asset = %slot.id,
            %from,
            to = %state,
            %reason,
            generation = slot.generation,
            "asset transition"
        );
        self.bus.publish(SysEvent::AssetTransition {
            id: slot.id.clone(),
            state,
            reason: Some(reason),
        });
    }

    /// Brings the slot in line with [`wants_running`](Self::wants_running).
    fn reconcile(&mut self, slot: &mut AssetSlot, reason: TransitionReason) {
        let wants = self.wants_running(slot);
        match slot.state {
            AssetState::Idle | AssetState::Terminated if wants => {
                slot.restart_count = 0;
                self.launch(slot, reason);
            }
            AssetState::Running | AssetState::Launching if !wants => self.drain(slot, reason, false),
            AssetState::Restarting if !wants => self.go_idle(slot, reason),
            AssetState::Terminated if !slot.overflow_hold || !slot.has_demand() => {
                slot.overflow_hold = false;
                self.go_idle(slot, reason);
            }
            _ => {}
        }
    }

    fn launch(&mut self, slot: &mut AssetSlot, reason: TransitionReason) {
        let Some(def) = slot.def.clone() else {
            return;
        };
        self.next_generation += 1;
        slot.generation = self.next_generation;
        slot.drain_reason = None;
        slot.grace_killed = false;
        self.transition(slot, AssetState::Launching, reason);

        match self.launcher.spawn(&def) {
            Ok(child) => {
                slot.process = Some(self.start_tasks(&def.id, slot.generation, child));
                self.transition(slot, AssetState::Running, reason);
            }
            Err(e) => {
                tracing::error!(asset = %def.id, command = %def.command, error = %e, "failed to spawn ingestor");
                self.crash(slot, TransitionReason::SpawnFailed);
            }
        }
    }

    fn start_tasks(&self, asset: &str, generation: u64, mut child: Box<dyn IngestorChild>) -> ProcessHandle {
        let cancel = CancellationToken::new();
        let stats = Arc::new(StreamStats::default());
        let (queue_tx, queue_rx) = mpsc::channel(self.policy.capacity());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let pid = child.id();

        if let Some(stdout) = child.take_stdout() {
            let reader = stream::run_reader(
                asset.to_string(),
                stdout,
                queue_tx,
                self.policy,
                Arc::clone(&stats),
                cancel.clone(),
            );
            let inbox = self.inbox.clone();
            let asset = asset.to_string();
            tokio::spawn(async move {
                if let ReaderOutcome::Overflow(reason) = reader.await {
                    let _ = inbox.send(SupervisorMsg::Overflow {
                        asset,
                        generation,
                        reason,
                    });
                }
            });
        }

        tokio::spawn(stream::run_pipeline(
            asset.to_string(),
            generation,
            queue_rx,
            self.arena.clone(),
            Arc::clone(&self.sink),
            self.tz,
            Arc::clone(&stats),
            cancel.clone(),
        ));

        if let Some(stderr) = child.take_stderr() {
            tokio::spawn(stream::run_stderr(asset.to_string(), stderr, cancel.clone()));
        }

        let inbox = self.inbox.clone();
        let asset = asset.to_string();
        tokio::spawn(async move {
            let result = stream::run_waiter(asset.clone(), child, control_rx).await;
            let _ = inbox.send(SupervisorMsg::Exited {
                asset,
                generation,
                result,
            });
        });

        ProcessHandle {
            control: control_tx,
            cancel,
            pid,
            launched_at: Utc::now(),
            started: Instant::now(),
            stats,
            killed: false,
        }
    }

    /// Stops the slot's process: SIGTERM plus grace timer, or SIGKILL when `force`.
    fn drain(&self, slot: &mut AssetSlot, reason: TransitionReason, force: bool) {
        let generation = slot.generation;
        let Some(process) = slot.process.as_mut() else {
            return;
        };
        if slot.state == AssetState::Draining {
            if force && !process.killed {
                process.kill();
                slot.drain_reason = Some(reason);
            }
            return;
        }

        if force {
            process.kill();
        } else {
            process.terminate();
            self.spawn_timer(
                self.config.grace_period(),
                SupervisorMsg::GraceElapsed {
                    asset: slot.id.clone(),
                    generation,
                },
            );
        }
        slot.drain_reason = Some(reason);
        self.transition(slot, AssetState::Draining, reason);
    }

    /// Unexpected exit or failed spawn.
    fn crash(&self, slot: &mut AssetSlot, reason: TransitionReason) {
        slot.restart_count += 1;
        self.transition(slot, AssetState::Restarting, reason);

        let restart = &self.config.restart;
        if slot.restart_count > restart.max_restarts {
            tracing::error!(
                asset = %slot.id,
                max_restarts = restart.max_restarts,
                "restart limit exceeded, asset failed"
            );
            self.arena.remove(&slot.id, slot.generation);
            self.transition(slot, AssetState::Failed, TransitionReason::RestartLimitExceeded);
            return;
        }

        let delay = restart.backoff_for(slot.restart_count);
        tracing::warn!(
            asset = %slot.id,
            attempt = slot.restart_count,
            delay_ms = delay.as_millis() as u64,
            "scheduling ingestor restart"
        );
        self.spawn_timer(
            delay,
            SupervisorMsg::RestartDue {
                asset: slot.id.clone(),
                generation: slot.generation,
            },
        );
    }

    fn go_idle(&self, slot: &mut AssetSlot, reason: TransitionReason) {
        self.arena.remove(&slot.id, slot.generation);
        if slot.def.is_none() {
            slot.paused_by_market = false;
        }
        self.transition(slot, AssetState::Idle, reason);
    }

    /// Decides what follows `Terminated`.
    fn after_terminated(&mut self, slot: &mut AssetSlot, reason: TransitionReason) {
        if slot.overflow_hold && slot.has_demand() {
            return;
        }
        slot.overflow_hold = false;
        let reboot = std::mem::take(&mut slot.reboot_pending);
        let can_reboot = reboot
            && slot.def.is_some()
            && !self.shutting_down
            && !slot.admin_paused
            && slot.state != AssetState::Failed;
        if self.wants_running(slot) || can_reboot {
            slot.restart_count = 0;
            self.launch(slot, reason);
        } else {
            self.go_idle(slot, reason);
        }
    }

    fn spawn_timer(&self, delay: Duration, msg: SupervisorMsg) {
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(msg);
        });
    }
}

/// # Ingestor Supervisor
///
/// Create with [`Supervisor::new`], hand the [`SupervisorHandle`] to the
/// dispatcher, then drive with [`Supervisor::run`].
pub struct Supervisor {
    rt: Runtime,
    slots: BTreeMap<String, AssetSlot>,
    inbox: mpsc::UnboundedReceiver<SupervisorMsg>,
    events: BusReceiver,
    views: watch::Sender<AssetViews>,
}

impl Supervisor {
    pub fn new(
        configs: Arc<ConfigManager>,
        launcher: Arc<dyn ProcessLauncher>,
        arena: ArenaHandle,
        bus: EventBus,
    ) -> Result<(Self, SupervisorHandle), SupervisorError> {
        let config = configs.current();
        let policy = config.backpressure.policy()?;
        let tz = config.reference_tz()?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (views_tx, views_rx) = watch::channel(AssetViews::default());
        // Only inputs; the supervisor's own transitions would crowd its queue.
        let events = bus.subscribe_filtered("supervisor", |event| {
            matches!(
                event,
                SysEvent::MarketStatus(_) | SysEvent::ConfigReloaded { .. } | SysEvent::ServerControl(_)
            )
        });

        let slots = config
            .assets
            .iter()
            .map(|def| (def.id.clone(), AssetSlot::new(def.id.clone(), Some(def.clone()))))
            .collect();

        let supervisor = Self {
            rt: Runtime {
                config_generation: configs.generation(),
                configs,
                config,
                policy,
                tz,
                launcher,
                arena,
                bus,
                sink: Arc::new(DiscardSink),
                inbox: inbox_tx.clone(),
                market: None,
                next_generation: 0,
                shutting_down: false,
            },
            slots,
            inbox: inbox_rx,
            events,
            views: views_tx,
        };
        let handle = SupervisorHandle {
            inbox: inbox_tx,
            views: views_rx,
        };
        Ok((supervisor, handle))
    }

    /// Runs until `shutdown` fires, then stops every ingestor.
    pub async fn run(mut self, sink: Arc<dyn TickSink>, shutdown: CancellationToken) {
        self.rt.sink = sink;
        tracing::info!(
            assets = self.slots.len(),
            capacity = self.rt.policy.capacity(),
            high_water = self.rt.policy.high_water(),
            sustained_ms = self.rt.policy.sustained().as_millis() as u64,
            "supervisor started"
        );

        for slot in self.slots.values_mut() {
            self.rt.reconcile(slot, TransitionReason::ConfigReloaded);
        }
        self.publish_views();

        let mut refresh = tokio::time::interval(VIEW_REFRESH);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(event) = self.events.recv() => self.on_event(event),
                Some(msg) = self.inbox.recv() => self.handle(msg),
                _ = refresh.tick() => {}
            }
            self.publish_views();
        }

        if self.events.dropped() > 0 {
            tracing::warn!(subscriber = self.events.name(), dropped = self.events.dropped(), "supervisor missed bus events");
        }
        self.shutdown().await;
        self.publish_views();
        tracing::info!("supervisor stopped");
    }

    fn handle(&mut self, msg: SupervisorMsg) {
        match msg {
            SupervisorMsg::Register(asset) => self.on_register(asset),
            SupervisorMsg::Unregister(asset) => self.on_unregister(&asset),
            SupervisorMsg::Exited {
                asset,
                generation,
                result,
            } => self.on_exit(&asset, generation, result),
            SupervisorMsg::Overflow {
                asset,
                generation,
                reason,
            } => self.on_overflow(&asset, generation, reason),
            SupervisorMsg::GraceElapsed { asset, generation } => self.on_grace_elapsed(&asset, generation),
            SupervisorMsg::RestartDue { asset, generation } => self.on_restart_due(&asset, generation),
        }
    }

    fn on_event(&mut self, event: SysEvent) {
        match event {
            SysEvent::MarketStatus(state) => self.on_market(state),
            SysEvent::ConfigReloaded { generation } => self.on_config(generation),
            SysEvent::ServerControl(command) => self.on_command(command),
            SysEvent::AssetTransition { .. } | SysEvent::TelemetryTick(_) => {}
        }
    }

    fn on_register(&mut self, asset: String) {
        let def = self.rt.config.asset(&asset).cloned();
        let slot = self
            .slots
            .entry(asset.clone())
            .or_insert_with(|| AssetSlot::new(asset, def));
        slot.subscribers += 1;
        slot.overflow_hold = false;
        self.rt.reconcile(slot, TransitionReason::Subscribed);
    }

    fn on_unregister(&mut self, asset: &str) {
        let Some(slot) = self.slots.get_mut(asset) else {
            return;
        };
        if slot.subscribers == 0 {
            tracing::warn!(asset, "unsubscribe without matching subscribe ignored");
            return;
        }
        slot.subscribers -= 1;
        self.rt.reconcile(slot, TransitionReason::Unsubscribed);
        self.prune(asset);
    }

    fn on_exit(&mut self, asset: &str, generation: u64, result: io::Result<ProcessExit>) {
        let Some(slot) = self.slots.get_mut(asset) else {
            return;
        };
        if slot.generation != generation || slot.process.is_none() {
            tracing::trace!(asset, generation, "exit of a previous incarnation ignored");
            return;
        }
        let uptime = slot.process.take().map(|process| {
            process.cancel.cancel();
            process.started.elapsed()
        });
        match &result {
            Ok(exit) => tracing::info!(asset, generation, %exit, "ingestor process exited"),
            Err(e) => tracing::warn!(asset, generation, error = %e, "lost track of ingestor process"),
        }

        if slot.state == AssetState::Draining {
            let drain_reason = slot.drain_reason.take().unwrap_or(TransitionReason::ProcessExited);
            let terminated_reason = if slot.grace_killed {
                TransitionReason::GracePeriodElapsed
            } else {
                drain_reason
            };
            if slot.overflow_hold {
                self.rt.arena.remove(&slot.id, slot.generation);
            }
            self.rt.transition(slot, AssetState::Terminated, terminated_reason);
            self.rt.after_terminated(slot, drain_reason);
        } else {
            let stable_after = self.rt.config.restart.stable_after();
            if slot.restart_count > 0 && uptime.is_some_and(|up| up >= stable_after) {
                tracing::info!(asset, generation, previous = slot.restart_count, "ingestor ran stably, restart budget reset");
                slot.restart_count = 0;
            }
            self.rt.crash(slot, TransitionReason::ProcessExited);
        }
        self.prune(asset);
    }

    fn on_overflow(&mut self, asset: &str, generation: u64, reason: KillReason) {
        let Some(slot) = self.slots.get_mut(asset) else {
            return;
        };
        if slot.generation != generation || slot.process.is_none() {
            return;
        }
        let verdict = serde_json::to_string(&reason).unwrap_or_default();
        tracing::error!(asset, generation, %reason, %verdict, "backpressure overflow, killing ingestor");
        slot.overflow_hold = true;
        self.rt.drain(slot, TransitionReason::BackpressureOverflow, true);
    }

    fn on_grace_elapsed(&mut self, asset: &str, generation: u64) {
        let Some(slot) = self.slots.get_mut(asset) else {
            return;
        };
        if slot.generation != generation || slot.state != AssetState::Draining {
            return;
        }
        if let Some(process) = slot.process.as_mut() {
            if !process.killed {
                tracing::warn!(asset, generation, "grace period elapsed, killing ingestor");
                slot.grace_killed = true;
                process.kill();
            }
        }
    }

    fn on_restart_due(&mut self, asset: &str, generation: u64) {
        let Some(slot) = self.slots.get_mut(asset) else {
            return;
        };
        if slot.generation != generation || slot.state != AssetState::Restarting {
            return;
        }
        if self.rt.wants_running(slot) {
            self.rt.launch(slot, TransitionReason::RestartBackoffElapsed);
        } else {
            self.rt.go_idle(slot, TransitionReason::RestartBackoffElapsed);
        }
        self.prune(asset);
    }

    fn on_market(&mut self, state: MarketState) {
        let before = self.rt.market_allows();
        self.rt.market = Some(state);
        let after = self.rt.market_allows();
        tracing::info!(market = %state, ingestion = after, "market status received");
        if before == after {
            return;
        }

        let reason = if after {
            TransitionReason::MarketOpened
        } else {
            TransitionReason::MarketClosed
        };
        for slot in self.slots.values_mut() {
            let follows = slot.def.as_ref().is_some_and(|d| d.follows_market_hours);
            if after {
                slot.paused_by_market = false;
            } else if follows && (slot.state.has_process() || slot.state == AssetState::Restarting) {
                slot.paused_by_market = true;
            }
            self.rt.reconcile(slot, reason);
        }
    }

    fn on_config(&mut self, generation: u64) {
        if generation <= self.rt.config_generation {
            return;
        }
        let config = self.rt.configs.current();
        let (policy, tz) = match (config.backpressure.policy(), config.reference_tz()) {
            (Ok(policy), Ok(tz)) => (policy, tz),
            (Err(e), _) => {
                tracing::error!(generation, error = %e, "reloaded config rejected by supervisor");
                return;
            }
            (_, Err(e)) => {
                tracing::error!(generation, error = %e, "reloaded config rejected by supervisor");
                return;
            }
        };
        self.rt.config_generation = generation;
        self.rt.config = Arc::clone(&config);
        self.rt.policy = policy;
        self.rt.tz = tz;

        for def in &config.assets {
            self.slots
                .entry(def.id.clone())
                .or_insert_with(|| AssetSlot::new(def.id.clone(), None));
        }

        for (id, slot) in self.slots.iter_mut() {
            let new_def = config.asset(id).cloned();
            let old_def = std::mem::replace(&mut slot.def, new_def);
            slot.overflow_hold = false;
            if slot.state == AssetState::Failed {
                slot.restart_count = 0;
                self.rt.transition(slot, AssetState::Idle, TransitionReason::ConfigReloaded);
            }

            let changed = match (&old_def, &slot.def) {
                (Some(old), Some(new)) => old.launch_differs(new),
                _ => false,
            };
            if old_def.is_some() && slot.def.is_none() {
                self.rt.reconcile(slot, TransitionReason::AssetRemoved);
            } else if changed && slot.state == AssetState::Running {
                self.rt.drain(slot, TransitionReason::ConfigChanged, false);
            } else {
                self.rt.reconcile(slot, TransitionReason::ConfigReloaded);
            }
        }
        self.prune_all();
        tracing::info!(generation, assets = config.assets.len(), "supervisor applied configuration");
    }

    fn on_command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::Pause { asset } => {
                for id in self.targets(asset.as_deref()) {
                    if let Some(slot) = self.slots.get_mut(&id) {
                        slot.admin_paused = true;
                        slot.pinned = false;
                        self.rt.reconcile(slot, TransitionReason::AdminPause);
                    }
                }
            }
            ServerCommand::Start { asset } => {
                for id in self.targets(asset.as_deref()) {
                    if let Some(slot) = self.slots.get_mut(&id) {
                        slot.admin_paused = false;
                        slot.pinned = true;
                        slot.overflow_hold = false;
                        if slot.state == AssetState::Failed {
                            slot.restart_count = 0;
                            self.rt.transition(slot, AssetState::Idle, TransitionReason::AdminStart);
                        }
                        self.rt.reconcile(slot, TransitionReason::AdminStart);
                    }
                }
            }
            ServerCommand::Reboot { asset } => {
                for id in self.targets(asset.as_deref()) {
                    if let Some(slot) = self.slots.get_mut(&id) {
                        slot.admin_paused = false;
                        slot.overflow_hold = false;
                        if slot.state == AssetState::Failed {
                            slot.restart_count = 0;
                            self.rt.transition(slot, AssetState::Idle, TransitionReason::AdminReboot);
                        }
                        if slot.state == AssetState::Running {
                            slot.reboot_pending = true;
                            self.rt.drain(slot, TransitionReason::AdminReboot, false);
                        } else {
                            self.rt.reconcile(slot, TransitionReason::AdminReboot);
                        }
                    }
                }
            }
            ServerCommand::SimulateMarket { .. } | ServerCommand::LiveMarket | ServerCommand::ReloadConfig => {}
        }
    }

    /// Asset ids an operator command applies to. A named asset known only to
    /// the config gets a slot on demand.
    fn targets(&mut self, asset: Option<&str>) -> Vec<String> {
        match asset {
            Some(id) => {
                if !self.slots.contains_key(id) {
                    match self.rt.config.asset(id) {
                        Some(def) => {
                            self.slots
                                .insert(id.to_string(), AssetSlot::new(id.to_string(), Some(def.clone())));
                        }
                        None => {
                            tracing::warn!(asset = id, "command for unknown asset ignored");
                            return Vec::new();
                        }
                    }
                }
                vec![id.to_string()]
            }
            None => self
                .slots
                .values()
                .filter(|s| s.def.is_some())
                .map(|s| s.id.clone())
                .collect(),
        }
    }

    fn prune(&mut self, asset: &str) {
        if self.slots.get(asset).is_some_and(AssetSlot::is_disposable) {
            self.slots.remove(asset);
        }
    }

    fn prune_all(&mut self) {
        self.slots.retain(|_, slot| !slot.is_disposable());
    }

    fn publish_views(&self) {
        let views: BTreeMap<String, AssetView> = self
            .slots
            .iter()
            .map(|(id, slot)| (id.clone(), slot.view()))
            .collect();
        self.views.send_replace(Arc::new(views));
    }

    /// Terminates every process, kills stragglers after the grace period.
    async fn shutdown(&mut self) {
        self.rt.shutting_down = true;
        for slot in self.slots.values_mut() {
            match slot.state {
                AssetState::Running | AssetState::Launching => {
                    self.rt.drain(slot, TransitionReason::Shutdown, false)
                }
                AssetState::Restarting => self.rt.go_idle(slot, TransitionReason::Shutdown),
                _ => {}
            }
        }

        let grace = self.rt.config.grace_period();
        let mut deadline = Instant::now() + grace;
        let mut killed = false;
        while self.slots.values().any(|s| s.process.is_some()) {
            match tokio::time::timeout_at(deadline, self.inbox.recv()).await {
                Ok(Some(msg)) => self.handle(msg),
                Ok(None) => break,
                Err(_) if !killed => {
                    killed = true;
                    for slot in self.slots.values_mut() {
                        if let Some(process) = slot.process.as_mut() {
                            tracing::warn!(asset = %slot.id, "ingestor ignored SIGTERM at shutdown, killing");
                            slot.grace_killed = true;
                            process.kill();
                        }
                    }
                    deadline = Instant::now() + grace;
                }
                Err(_) => {
                    tracing::error!("ingestors still running after SIGKILL, abandoning");
                    break;
                }
            }
        }
    }
}
