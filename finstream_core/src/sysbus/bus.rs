//! # Lossy Control-Plane Bus
//!
//! Each subscriber owns a bounded queue. `publish` never waits: when a
//! subscriber's queue is full the event is dropped for that subscriber alone and
//! the drop is counted. Closed subscribers are pruned on the next publish.
//!
//! A subscriber may name the event kinds it cares about; other events never
//! enter its queue and so cannot crowd out the ones it handles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

use super::events::SysEvent;

/// Default per-subscriber queue capacity.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Drops are logged on the first occurrence and then every this many.
const DROP_LOG_EVERY: u64 = 100;

/// Selects the events a subscriber receives.
pub type EventFilter = fn(&SysEvent) -> bool;

struct Subscriber {
    name: String,
    filter: Option<EventFilter>,
    sender: mpsc::Sender<SysEvent>,
    dropped: Arc<AtomicU64>,
}

struct BusInner {
    capacity: usize,
    subscribers: Mutex<Vec<Subscriber>>,
    dropped_total: AtomicU64,
}

/// # Event Bus
///
/// Typed publish/subscribe for [`SysEvent`]s. Cloning is cheap and every clone
/// publishes to the same subscriber set.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Creates a bus whose subscribers each get a queue of `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                subscribers: Mutex::new(Vec::new()),
                dropped_total: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a subscriber to every event. `name` only shows up in logs.
    pub fn subscribe(&self, name: &str) -> BusReceiver {
        self.register(name, None)
    }

    /// Registers a subscriber that only receives events accepted by `filter`.
    pub fn subscribe_filtered(&self, name: &str, filter: EventFilter) -> BusReceiver {
        self.register(name, Some(filter))
    }

    fn register(&self, name: &str, filter: Option<EventFilter>) -> BusReceiver {
        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        self.inner.subscribers.lock().push(Subscriber {
            name: name.to_string(),
            filter,
            sender,
            dropped: Arc::clone(&dropped),
        });
        tracing::debug!(subscriber = name, capacity = self.inner.capacity, "bus subscriber registered");
        BusReceiver {
            name: name.to_string(),
            receiver,
            dropped,
        }
    }

    /// Offers `event` to every subscriber without waiting.
    ///
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, event: SysEvent) -> usize {
        let mut delivered = 0;
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|sub| {
            if sub.filter.is_some_and(|accepts| !accepts(&event)) {
                return !sub.sender.is_closed();
            }
            match sub.sender.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(dropped_event)) => {
                    let count = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    self.inner.dropped_total.fetch_add(1, Ordering::Relaxed);
                    if count == 1 || count % DROP_LOG_EVERY == 0 {
                        tracing::warn!(
                            subscriber = %sub.name,
                            event = dropped_event.kind(),
                            dropped = count,
                            "bus subscriber queue full, event dropped"
                        );
                    }
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(subscriber = %sub.name, "bus subscriber gone, pruning");
                    false
                }
            }
        });
        delivered
    }

    /// Total events dropped across all subscribers since start.
    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }

    /// Number of live subscribers (as of the last publish).
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// Receiving half handed out by [`EventBus::subscribe`].
pub struct BusReceiver {
    name: String,
    receiver: mpsc::Receiver<SysEvent>,
    dropped: Arc<AtomicU64>,
}

impl BusReceiver {
    /// Waits for the next event. `None` once every bus handle is gone.
    pub async fn recv(&mut self) -> Option<SysEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking receive; `None` when the queue is currently empty or closed.
    pub fn try_recv(&mut self) -> Option<SysEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Events this subscriber lost to a full queue.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Name given at subscription.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysbus::events::MarketState;

    fn status(n: usize) -> SysEvent {
        if n % 2 == 0 {
            SysEvent::MarketStatus(MarketState::Open)
        } else {
            SysEvent::MarketStatus(MarketState::Closed)
        }
    }

    #[test]
    fn test_overflow_drops_newest_for_that_subscriber_only() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe("slow");
        let mut fast = bus.subscribe("fast");

        bus.publish(SysEvent::ConfigReloaded { generation: 1 });
        assert_eq!(fast.try_recv(), Some(SysEvent::ConfigReloaded { generation: 1 }));
        bus.publish(SysEvent::ConfigReloaded { generation: 2 });
        assert_eq!(fast.try_recv(), Some(SysEvent::ConfigReloaded { generation: 2 }));

        // `slow` is now full; the third event is dropped for it alone.
        let delivered = bus.publish(SysEvent::ConfigReloaded { generation: 3 });
        assert_eq!(delivered, 1);
        assert_eq!(fast.try_recv(), Some(SysEvent::ConfigReloaded { generation: 3 }));

        assert_eq!(slow.try_recv(), Some(SysEvent::ConfigReloaded { generation: 1 }));
        assert_eq!(slow.try_recv(), Some(SysEvent::ConfigReloaded { generation: 2 }));
        assert_eq!(slow.try_recv(), None);
        assert_eq!(slow.dropped(), 1);
        assert_eq!(fast.dropped(), 0);
        assert_eq!(bus.dropped_total(), 1);
    }

    #[test]
    fn test_single_subscriber_sees_publish_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe("ordered");
        for n in 0..10 {
            bus.publish(status(n));
        }
        for n in 0..10 {
            assert_eq!(rx.try_recv(), Some(status(n)));
        }
    }

    #[test]
    fn test_closed_subscribers_are_pruned() {
        let bus = EventBus::new(4);
        let keep = bus.subscribe("keep");
        drop(bus.subscribe("gone"));
        assert_eq!(bus.subscriber_count(), 2);
        bus.publish(SysEvent::ConfigReloaded { generation: 1 });
        assert_eq!(bus.subscriber_count(), 1);
        drop(keep);
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(SysEvent::MarketStatus(MarketState::Open)), 0);
        assert_eq!(bus.dropped_total(), 0);
    }

    #[test]
    fn test_filtered_subscriber_never_fills_with_other_kinds() {
        let bus = EventBus::new(2);
        let mut control = bus.subscribe_filtered("control", |event| {
            matches!(event, SysEvent::ServerControl(_) | SysEvent::ConfigReloaded { .. })
        });
        let mut everything = bus.subscribe("everything");

        for n in 0..10 {
            bus.publish(status(n));
        }
        bus.publish(SysEvent::ConfigReloaded { generation: 7 });

        assert_eq!(control.try_recv(), Some(SysEvent::ConfigReloaded { generation: 7 }));
        assert_eq!(control.try_recv(), None);
        assert_eq!(control.dropped(), 0);
        // The unfiltered subscriber kept the first two and lost the rest.
        assert_eq!(everything.dropped(), 9);
        assert_eq!(bus.dropped_total(), 9);
    }

    #[test]
    fn test_filtered_subscriber_is_pruned_when_closed() {
        let bus = EventBus::new(4);
        drop(bus.subscribe_filtered("gone", |event| matches!(event, SysEvent::ServerControl(_))));
        bus.publish(SysEvent::MarketStatus(MarketState::Open));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_recv_waits_for_publish() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe("waiter");
        let publisher = bus.clone();
        tokio::spawn(async move {
            publisher.publish(SysEvent::MarketStatus(MarketState::PreMarket));
        });
        assert_eq!(rx.recv().await, Some(SysEvent::MarketStatus(MarketState::PreMarket)));
    }
}
