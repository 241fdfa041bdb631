//! # Freshness Arena
//!
//! Ranks assets by how stale their latest tick is. For every asset the arena
//! keeps only the most recent tick and derives from it:
//!
//! - **lag**: `received_at - exchange_ts`, signed milliseconds;
//! - **degraded**: lag strictly above one second;
//! - **severity**: how far past the threshold the lag is, on a 0..100 scale
//!   that grows with the excess and never reaches 100.
//!
//! [`Arena`] is the pure data structure. [`ArenaService`] owns one inside a
//! dedicated task so every mutation comes from a single writer, and publishes
//! ranking snapshots through a `watch` channel. The ranking is advisory: it
//! never feeds back into supervision.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::tick::Tick;

/// Lag above which a source counts as degraded.
pub const DEGRADED_THRESHOLD_MS: i64 = 1_000;

/// Commands drained per wake-up before a snapshot is republished.
const MAX_BATCH: usize = 256;

/// Per-asset freshness record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaEntry {
    pub last_tick: Tick,
    pub lag_ms: i64,
    pub degraded: bool,
    pub severity: u8,
}

impl ArenaEntry {
    fn from_tick(tick: Tick) -> Self {
        let lag_ms = tick.lag_ms();
        Self {
            degraded: lag_ms > DEGRADED_THRESHOLD_MS,
            severity: severity_for(lag_ms),
            lag_ms,
            last_tick: tick,
        }
    }
}

/// `100 * excess / (excess + 1000)` in whole points, where `excess` is the lag
/// beyond the threshold. Zero when not degraded.
pub fn severity_for(lag_ms: i64) -> u8 {
    let excess = lag_ms.saturating_sub(DEGRADED_THRESHOLD_MS);
    if excess <= 0 {
        return 0;
    }
    let excess = excess as i128;
    (excess * 100 / (excess + DEGRADED_THRESHOLD_MS as i128)) as u8
}

/// One line of the published ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedSource {
    /// 1-based position, freshest first.
    pub rank: usize,
    pub asset_id: String,
    pub lag_ms: i64,
    pub degraded: bool,
    pub severity: u8,
    pub price: Decimal,
    pub exchange_ts: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// Ordered view of the arena at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingSnapshot {
    pub sources: Vec<RankedSource>,
    pub degraded_count: usize,
}

impl RankingSnapshot {
    pub fn get(&self, asset_id: &str) -> Option<&RankedSource> {
        self.sources.iter().find(|s| s.asset_id == asset_id)
    }

    pub fn contains(&self, asset_id: &str) -> bool {
        self.get(asset_id).is_some()
    }
}

/// # Arena
///
/// Latest-tick table keyed by asset id.
#[derive(Debug, Default)]
pub struct Arena {
    entries: HashMap<String, ArenaEntry>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the asset's entry with one computed from `tick`.
    pub fn on_tick(&mut self, tick: Tick) {
        let entry = ArenaEntry::from_tick(tick);
        self.entries.insert(entry.last_tick.asset_id.clone(), entry);
    }

    /// Drops the asset's entry; returns whether it existed.
    pub fn remove(&mut self, asset_id: &str) -> bool {
        self.entries.remove(asset_id).is_some()
    }

    pub fn get(&self, asset_id: &str) -> Option<&ArenaEntry> {
        self.entries.get(asset_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ranking ordered by ascending lag, ties broken by asset id.
    pub fn snapshot(&self) -> RankingSnapshot {
        let mut ordered: Vec<&ArenaEntry> = self.entries.values().collect();
        ordered.sort_by(|a, b| {
            a.lag_ms
                .cmp(&b.lag_ms)
                .then_with(|| a.last_tick.asset_id.cmp(&b.last_tick.asset_id))
        });
        let sources: Vec<RankedSource> = ordered
            .into_iter()
            .enumerate()
            .map(|(i, e)| RankedSource {
                rank: i + 1,
                asset_id: e.last_tick.asset_id.clone(),
                lag_ms: e.lag_ms,
                degraded: e.degraded,
                severity: e.severity,
                price: e.last_tick.price,
                exchange_ts: e.last_tick.exchange_ts,
                received_at: e.last_tick.received_at,
            })
            .collect();
        let degraded_count = sources.iter().filter(|s| s.degraded).count();
        RankingSnapshot {
            sources,
            degraded_count,
        }
    }

    pub fn degraded_count(&self) -> usize {
        self.snapshot().degraded_count
    }
}

enum ArenaCommand {
    Apply { tick: Tick, generation: u64 },
    Remove { asset_id: String, generation: u64 },
    Query(oneshot::Sender<Arc<RankingSnapshot>>),
}

/// Cloneable front of an [`ArenaService`].
#[derive(Clone)]
pub struct ArenaHandle {
    commands: mpsc::UnboundedSender<ArenaCommand>,
    snapshots: watch::Receiver<Arc<RankingSnapshot>>,
}

impl ArenaHandle {
    /// Queues a tick produced by process incarnation `generation`.
    pub fn apply(&self, tick: Tick, generation: u64) {
        let _ = self.commands.send(ArenaCommand::Apply { tick, generation });
    }

    /// Removes the asset and ignores later ticks from generations up to `generation`.
    pub fn remove(&self, asset_id: &str, generation: u64) {
        let _ = self.commands.send(ArenaCommand::Remove {
            asset_id: asset_id.to_string(),
            generation,
        });
    }

    /// Snapshot reflecting every command sent through this handle before the call.
    ///
    /// Falls back to the last published snapshot if the service has stopped.
    pub async fn query(&self) -> Arc<RankingSnapshot> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(ArenaCommand::Query(tx)).is_err() {
            return self.latest();
        }
        match rx.await {
            Ok(snapshot) => snapshot,
            Err(_) => self.latest(),
        }
    }

    /// Last published snapshot, without waiting.
    pub fn latest(&self) -> Arc<RankingSnapshot> {
        self.snapshots.borrow().clone()
    }
}

/// # Arena Service
///
/// Single-writer task around an [`Arena`].
pub struct ArenaService {
    arena: Arena,
    /// Highest generation removed per asset; applies at or below it are stale.
    fences: HashMap<String, u64>,
    commands: mpsc::UnboundedReceiver<ArenaCommand>,
    snapshots: watch::Sender<Arc<RankingSnapshot>>,
}

impl ArenaService {
    pub fn new() -> (Self, ArenaHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (snap_tx, snap_rx) = watch::channel(Arc::new(RankingSnapshot::default()));
        let service = Self {
            arena: Arena::new(),
            fences: HashMap::new(),
            commands: cmd_rx,
            snapshots: snap_tx,
        };
        let handle = ArenaHandle {
            commands: cmd_tx,
            snapshots: snap_rx,
        };
        (service, handle)
    }

    /// Runs until `shutdown` fires or every handle is dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut batch = Vec::with_capacity(MAX_BATCH);
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                n = self.commands.recv_many(&mut batch, MAX_BATCH) => n,
            };
            if received == 0 {
                break;
            }

            let mut dirty = false;
            let mut waiters = Vec::new();
            for cmd in batch.drain(..) {
                match cmd {
                    ArenaCommand::Apply { tick, generation } => {
                        dirty |= self.apply(tick, generation);
                    }
                    ArenaCommand::Remove { asset_id, generation } => {
                        dirty |= self.remove(asset_id, generation);
                    }
                    ArenaCommand::Query(reply) => {
                        // Answer after the batch so the reply covers everything queued before it.
                        waiters.push(reply);
                    }
                }
            }

            if dirty {
                let snapshot = Arc::new(self.arena.snapshot());
                self.snapshots.send_replace(snapshot);
            }
            if !waiters.is_empty() {
                let current = self.snapshots.borrow().clone();
                for reply in waiters {
                    let _ = reply.send(Arc::clone(&current));
                }
            }
        }
        tracing::debug!(entries = self.arena.len(), "arena service stopped");
    }

    fn apply(&mut self, tick: Tick, generation: u64) -> bool {
        if let Some(&fence) = self.fences.get(&tick.asset_id) {
            if generation <= fence {
                tracing::trace!(asset = %tick.asset_id, generation, fence, "stale tick ignored");
                return false;
            }
        }
        self.arena.on_tick(tick);
        true
    }

    fn remove(&mut self, asset_id: String, generation: u64) -> bool {
        let removed = self.arena.remove(&asset_id);
        let fence = self.fences.entry(asset_id).or_insert(generation);
        *fence = (*fence).max(generation);
        removed
    }
}
