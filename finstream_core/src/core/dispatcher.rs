//! # Tick Fan-out Dispatcher
//!
//! The `Dispatcher` hands every parsed tick to the downstream clients (e.g.
//! WebSocket sessions) that subscribed to its asset.
//!
//! ## Core Design Principles:
//!
//! 1.  **Zero-Copy Fan-out**: ticks travel as `Arc<Tick>`. Every subscribed
//!     client receives a new pointer to the same allocation.
//!
//! 2.  **Bounded Client Queues**: each client owns a bounded channel. Delivery
//!     waits for room instead of dropping, so a client that stops reading stalls
//!     the pipeline of the assets it subscribed to. The stall travels back to
//!     the ingestor's output queue, where the backpressure policy stops the
//!     producer.
//!
//! 3.  **Demand Registration**: subscribing a client to an asset registers a
//!     subscriber with the supervisor, which is what brings an ingestor up.
//!     Unsubscribing, removing the client or the client going away releases it.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::supervisor::SupervisorHandle;
use super::tick::Tick;

/// Receives the ticks produced by ingestor pipelines.
#[async_trait]
pub trait TickSink: Send + Sync + 'static {
    /// Delivers one tick. May wait; the caller's pipeline waits with it.
    async fn deliver(&self, tick: Arc<Tick>);
}

/// # Client Handle
///
/// One downstream consumer and the assets it asked for.
struct ClientHandle {
    id: String,
    sender: mpsc::Sender<Arc<Tick>>,
    assets: BTreeSet<String>,
}

/// # Core Dispatcher
///
/// Manages client registration, per-client asset subscriptions and tick fan-out.
pub struct Dispatcher {
    clients: Mutex<Vec<ClientHandle>>,
    supervisor: SupervisorHandle,
    queue_capacity: usize,
    delivered: AtomicU64,
}

impl Dispatcher {
    /// Creates a dispatcher whose clients get queues of `queue_capacity` ticks.
    pub fn new(supervisor: SupervisorHandle, queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(Vec::new()),
            supervisor,
            queue_capacity: queue_capacity.max(1),
            delivered: AtomicU64::new(0),
        })
    }

    /// # Add Client
    ///
    /// Registers a client and returns the receiving half of its tick queue. A
    /// client registered again under the same id replaces the old one.
    pub fn add_client(&self, id: &str) -> mpsc::Receiver<Arc<Tick>> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let replaced = {
            let mut clients = self.clients.lock();
            let replaced = take_client(&mut clients, id);
            clients.push(ClientHandle {
                id: id.to_string(),
                sender: tx,
                assets: BTreeSet::new(),
            });
            replaced
        };
        if let Some(old) = replaced {
            self.release(&old);
        }
        tracing::info!(client = id, "client registered");
        rx
    }

    /// Subscribes `client` to `asset`. Returns `false` for unknown clients and
    /// repeated subscriptions.
    pub fn subscribe(&self, client: &str, asset: &str) -> bool {
        let added = {
            let mut clients = self.clients.lock();
            match clients.iter_mut().find(|c| c.id == client) {
                Some(handle) => handle.assets.insert(asset.to_string()),
                None => false,
            }
        };
        if added {
            self.supervisor.register_subscriber(asset);
            tracing::debug!(client, asset, "client subscribed");
        }
        added
    }

    /// Drops `client`'s subscription to `asset`; returns whether it existed.
    pub fn unsubscribe(&self, client: &str, asset: &str) -> bool {
        let removed = {
            let mut clients = self.clients.lock();
            match clients.iter_mut().find(|c| c.id == client) {
                Some(handle) => handle.assets.remove(asset),
                None => false,
            }
        };
        if removed {
            self.supervisor.unregister_subscriber(asset);
            tracing::debug!(client, asset, "client unsubscribed");
        }
        removed
    }

    /// Removes a client and releases all of its subscriptions.
    pub fn remove_client(&self, id: &str) {
        let removed = take_client(&mut self.clients.lock(), id);
        if let Some(handle) = removed {
            self.release(&handle);
            tracing::info!(client = id, "client removed");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Ticks handed to client queues since start.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn release(&self, handle: &ClientHandle) {
        for asset in &handle.assets {
            self.supervisor.unregister_subscriber(asset);
        }
    }
}

fn take_client(clients: &mut Vec<ClientHandle>, id: &str) -> Option<ClientHandle> {
    let position = clients.iter().position(|c| c.id == id)?;
    Some(clients.swap_remove(position))
}

#[async_trait]
impl TickSink for Dispatcher {
    async fn deliver(&self, tick: Arc<Tick>) {
        let targets: Vec<(String, mpsc::Sender<Arc<Tick>>)> = self
            .clients
            .lock()
            .iter()
            .filter(|c| c.assets.contains(&tick.asset_id))
            .map(|c| (c.id.clone(), c.sender.clone()))
            .collect();

        let mut gone = Vec::new();
        for (id, sender) in targets {
            match sender.send(Arc::clone(&tick)).await {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => gone.push((id, sender)),
            }
        }

        for (id, sender) in gone {
            let removed = {
                let mut clients = self.clients.lock();
                // Only prune the handle that failed; the id may have been re-registered meanwhile.
                match clients.iter().position(|c| c.id == id && c.sender.same_channel(&sender)) {
                    Some(position) => Some(clients.swap_remove(position)),
                    None => None,
                }
            };
            if let Some(handle) = removed {
                tracing::info!(client = %id, "client disconnected, removing from dispatcher");
                self.release(&handle);
            }
        }
    }
}

/// Sink that drops every tick. Used until a real sink is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

#[async_trait]
impl TickSink for DiscardSink {
    async fn deliver(&self, _tick: Arc<Tick>) {}
}
