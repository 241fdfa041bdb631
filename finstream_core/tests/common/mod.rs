//! Shared fixtures for the supervisor integration tests: a scripted process
//! launcher and a harness wiring the engine together around it.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use finstream_core::configs::{AssetDefinition, ConfigManager, EngineConfig};
use finstream_core::core::{ArenaHandle, ArenaService, Dispatcher, Supervisor, SupervisorHandle};
use finstream_core::ingestors::process::ChildOutput;
use finstream_core::ingestors::{IngestorChild, ProcessExit, ProcessLauncher};
use finstream_core::sysbus::{AssetState, BusReceiver, EventBus, SysEvent, TransitionReason};

pub const SIGTERM: i32 = 15;
pub const SIGKILL: i32 = 9;

/// Test-side controls of one fake ingestor process.
pub struct FakeProcess {
    pub asset: String,
    pub pid: u32,
    stdout: tokio::sync::Mutex<Option<DuplexStream>>,
    exit: mpsc::UnboundedSender<ProcessExit>,
    signals: Arc<Mutex<Vec<&'static str>>>,
}

impl FakeProcess {
    /// Writes one stdout line.
    pub async fn write_line(&self, line: &str) {
        let mut stdout = self.stdout.lock().await;
        if let Some(out) = stdout.as_mut() {
            let _ = out.write_all(format!("{line}\n").as_bytes()).await;
        }
    }

    pub async fn close_stdout(&self) {
        self.stdout.lock().await.take();
    }

    /// Makes the process exit on its own.
    pub fn exit(&self, code: i32) {
        let _ = self.exit.send(ProcessExit::exited(code));
    }

    /// Signals received so far, `"TERM"` or `"KILL"`.
    pub fn signals(&self) -> Vec<&'static str> {
        self.signals.lock().clone()
    }
}

struct FakeChild {
    pid: u32,
    stdout: Option<DuplexStream>,
    exit_tx: mpsc::UnboundedSender<ProcessExit>,
    exit_rx: mpsc::UnboundedReceiver<ProcessExit>,
    exited: Option<ProcessExit>,
    signals: Arc<Mutex<Vec<&'static str>>>,
    exit_on_terminate: bool,
}

#[async_trait]
impl IngestorChild for FakeChild {
    fn id(&self) -> Option<u32> {
        self.exited.is_none().then_some(self.pid)
    }

    fn take_stdout(&mut self) -> Option<ChildOutput> {
        self.stdout.take().map(|s| Box::new(s) as ChildOutput)
    }

    fn take_stderr(&mut self) -> Option<ChildOutput> {
        None
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.signals.lock().push("TERM");
        if self.exit_on_terminate {
            let _ = self.exit_tx.send(ProcessExit::signalled(SIGTERM));
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.signals.lock().push("KILL");
        let _ = self.exit_tx.send(ProcessExit::signalled(SIGKILL));
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<ProcessExit> {
        if let Some(exit) = self.exited {
            return Ok(exit);
        }
        match self.exit_rx.recv().await {
            Some(exit) => {
                self.exited = Some(exit);
                Ok(exit)
            }
            None => std::future::pending().await,
        }
    }
}

/// Launcher handing out scripted children and remembering every spawn.
pub struct FakeLauncher {
    spawned: Mutex<HashMap<String, Vec<Arc<FakeProcess>>>>,
    failing: Mutex<HashSet<String>>,
    exit_on_terminate: Mutex<bool>,
    next_pid: Mutex<u32>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            spawned: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            exit_on_terminate: Mutex::new(true),
            next_pid: Mutex::new(1000),
        })
    }

    /// Whether children exit as soon as they get SIGTERM (default) or ignore it.
    pub fn set_exit_on_terminate(&self, value: bool) {
        *self.exit_on_terminate.lock() = value;
    }

    pub fn set_failing(&self, asset: &str, failing: bool) {
        let mut set = self.failing.lock();
        if failing {
            set.insert(asset.to_string());
        } else {
            set.remove(asset);
        }
    }

    pub fn spawn_count(&self, asset: &str) -> usize {
        self.spawned.lock().get(asset).map_or(0, Vec::len)
    }

    /// Most recent process spawned for `asset`.
    pub fn latest(&self, asset: &str) -> Arc<FakeProcess> {
        self.spawned
            .lock()
            .get(asset)
            .and_then(|all| all.last().cloned())
            .unwrap_or_else(|| panic!("no process spawned for {asset}"))
    }
}

impl ProcessLauncher for FakeLauncher {
    fn spawn(&self, def: &AssetDefinition) -> io::Result<Box<dyn IngestorChild>> {
        if self.failing.lock().contains(&def.id) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such ingestor"));
        }
        let pid = {
            let mut next = self.next_pid.lock();
            *next += 1;
            *next
        };
        let (test_side, child_side) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let signals = Arc::new(Mutex::new(Vec::new()));

        let process = Arc::new(FakeProcess {
            asset: def.id.clone(),
            pid,
            stdout: tokio::sync::Mutex::new(Some(test_side)),
            exit: exit_tx.clone(),
            signals: Arc::clone(&signals),
        });
        self.spawned
            .lock()
            .entry(def.id.clone())
            .or_default()
            .push(process);

        Ok(Box::new(FakeChild {
            pid,
            stdout: Some(child_side),
            exit_tx,
            exit_rx,
            exited: None,
            signals,
            exit_on_terminate: *self.exit_on_terminate.lock(),
        }))
    }
}

/// An `AssetDefinition` for the fake launcher.
pub fn asset(id: &str) -> AssetDefinition {
    AssetDefinition::new(id, "fake-ingestor", vec![])
}

pub fn autostart(id: &str) -> AssetDefinition {
    AssetDefinition {
        autostart: true,
        ..asset(id)
    }
}

pub fn config(assets: Vec<AssetDefinition>) -> EngineConfig {
    EngineConfig {
        assets,
        ..EngineConfig::default()
    }
}

/// One observed `AssetTransition`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub asset: String,
    pub state: AssetState,
    pub reason: Option<TransitionReason>,
}

/// Records asset transitions seen on the bus.
pub struct Recorder {
    events: BusReceiver,
    pub log: Vec<Transition>,
}

impl Recorder {
    pub fn new(bus: &EventBus) -> Self {
        Self {
            events: bus.subscribe("test-recorder"),
            log: Vec::new(),
        }
    }

    /// Reads the bus until `asset` has entered `state` `count` times in total.
    pub async fn until_nth(&mut self, asset: &str, state: AssetState, count: usize) -> Transition {
        loop {
            let matches: Vec<&Transition> = self
                .log
                .iter()
                .filter(|t| t.asset == asset && t.state == state)
                .collect();
            if matches.len() >= count {
                return matches[count - 1].clone();
            }
            match self.events.recv().await {
                Some(SysEvent::AssetTransition { id, state, reason }) => self.log.push(Transition {
                    asset: id,
                    state,
                    reason,
                }),
                Some(_) => {}
                None => panic!("bus closed"),
            }
        }
    }

    pub async fn until(&mut self, asset: &str, state: AssetState) -> Transition {
        self.until_nth(asset, state, 1).await
    }

    /// Transitions of `asset` recorded so far, in order.
    pub fn of(&self, asset: &str) -> Vec<(AssetState, Option<TransitionReason>)> {
        self.log
            .iter()
            .filter(|t| t.asset == asset)
            .map(|t| (t.state, t.reason))
            .collect()
    }

    /// Picks up anything already queued without waiting.
    pub fn drain_pending(&mut self) {
        while let Some(event) = self.events.try_recv() {
            if let SysEvent::AssetTransition { id, state, reason } = event {
                self.log.push(Transition {
                    asset: id,
                    state,
                    reason,
                });
            }
        }
    }
}

/// The engine around a [`FakeLauncher`]: bus, config manager, arena,
/// supervisor and dispatcher, all running.
pub struct Harness {
    pub bus: EventBus,
    pub configs: Arc<ConfigManager>,
    pub launcher: Arc<FakeLauncher>,
    pub arena: ArenaHandle,
    pub supervisor: SupervisorHandle,
    pub dispatcher: Arc<Dispatcher>,
    pub recorder: Recorder,
    pub shutdown: CancellationToken,
    supervisor_task: Option<JoinHandle<()>>,
}

impl Harness {
    pub fn start(config: EngineConfig) -> Self {
        Self::start_with(config, FakeLauncher::new())
    }

    pub fn start_with(config: EngineConfig, launcher: Arc<FakeLauncher>) -> Self {
        let bus = EventBus::new(config.bus_capacity);
        let recorder = Recorder::new(&bus);
        let queue_capacity = config.client_queue_capacity;
        let configs = ConfigManager::new(config, None, bus.clone()).expect("valid test config");
        let shutdown = CancellationToken::new();

        let (arena_service, arena) = ArenaService::new();
        tokio::spawn(arena_service.run(shutdown.clone()));

        let (supervisor, handle) = Supervisor::new(
            Arc::clone(&configs),
            Arc::clone(&launcher) as Arc<dyn ProcessLauncher>,
            arena.clone(),
            bus.clone(),
        )
        .expect("supervisor");
        let dispatcher = Dispatcher::new(handle.clone(), queue_capacity);
        let supervisor_task = tokio::spawn(supervisor.run(dispatcher.clone(), shutdown.clone()));

        Self {
            bus,
            configs,
            launcher,
            arena,
            supervisor: handle,
            dispatcher,
            recorder,
            shutdown,
            supervisor_task: Some(supervisor_task),
        }
    }

    /// Cancels the engine and waits for the supervisor to finish its shutdown.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.supervisor_task.take() {
            task.await.expect("supervisor task");
        }
    }
}

/// A tick line with a millisecond exchange timestamp.
pub fn tick_line(price: &str, ts_ms: i64) -> String {
    format!(r#"{{"price": "{price}", "ts": {ts_ms}}}"#)
}
