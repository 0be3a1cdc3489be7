//! Publish/subscribe broadcast for lifecycle and discovery events.
//!
//! Every subscriber owns a bounded channel. [`EventBus::emit`] awaits each
//! live subscriber in turn, so a slow subscriber slows the emitter down
//! instead of losing events. Emits are serialized against each other;
//! subscribe and unsubscribe only ever take the short registry lock, so
//! they never wait behind a blocked emit.

use crate::models::Event;

use async_trait::async_trait;
use futures::Stream;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Identifies one subscription on one bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscriber {
    tx: mpsc::Sender<Event>,
    removed: CancellationToken,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    closed: bool,
    subscribers: BTreeMap<SubscriberId, Subscriber>,
}

/// One-to-many, in-order broadcast of [`Event`]s. Clones share the bus.
#[derive(Clone)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
    emit_lock: Arc<tokio::sync::Mutex<()>>,
    capacity: usize,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1)
    }
}

impl EventBus {
    /// Creates a bus whose subscribers buffer at most `capacity` events
    /// (minimum one) before the emitter has to wait.
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            emit_lock: Arc::new(tokio::sync::Mutex::new(())),
            capacity: capacity.max(1),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a subscriber. Returns `None` once the bus has been closed.
    pub fn subscribe(&self) -> Option<Subscription> {
        let mut registry = self.registry();
        if registry.closed {
            return None;
        }
        let id = SubscriberId(registry.next_id);
        registry.next_id += 1;

        let (tx, rx) = mpsc::channel(self.capacity);
        let removed = CancellationToken::new();
        registry.subscribers.insert(
            id,
            Subscriber {
                tx,
                removed: removed.clone(),
            },
        );
        debug!(subscriber = %id, "subscribed");
        Some(Subscription { id, rx, removed })
    }

    /// Stops deliveries to `id` and closes its subscription. Unknown or
    /// already-removed ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        if let Some(subscriber) = self.registry().subscribers.remove(&id) {
            subscriber.removed.cancel();
            debug!(subscriber = %id, "unsubscribed");
        }
    }

    /// Delivers `event` to every live subscriber and returns how many
    /// accepted it. Waits on any subscriber whose buffer is full.
    pub async fn emit(&self, event: Event) -> usize {
        let _serialized = self.emit_lock.lock().await;

        let targets: Vec<_> = self
            .registry()
            .subscribers
            .iter()
            .map(|(id, s)| (*id, s.tx.clone(), s.removed.clone()))
            .collect();

        let mut delivered = 0;
        for (id, tx, removed) in targets {
            tokio::select! {
                biased;
                _ = removed.cancelled() => {
                    trace!(subscriber = %id, "removed during emit");
                }
                sent = tx.send(event.clone()) => match sent {
                    Ok(()) => delivered += 1,
                    Err(_) => {
                        debug!(subscriber = %id, "subscription dropped, removing");
                        self.unsubscribe(id);
                    }
                },
            }
        }
        trace!(kind = %event.kind(), delivered, "emitted");
        delivered
    }

    /// Closes every live subscription and refuses new ones.
    pub fn close(&self) {
        let mut registry = self.registry();
        if registry.closed {
            return;
        }
        registry.closed = true;
        for (_, subscriber) in std::mem::take(&mut registry.subscribers) {
            subscriber.removed.cancel();
        }
        debug!("event bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.registry().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().subscribers.len()
    }
}

/// Receive side of one subscription.
///
/// `recv` yields `None` once the subscription has been removed through
/// [`EventBus::unsubscribe`] or [`EventBus::close`].
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Event>,
    removed: CancellationToken,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Event> {
        tokio::select! {
            biased;
            _ = self.removed.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.removed.is_cancelled()
    }

    pub fn into_stream(self) -> impl Stream<Item = Event> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}

/// Components that broadcast events do so through an owned [`EventBus`].
#[async_trait]
pub trait Publisher: Send + Sync {
    fn event_bus(&self) -> &EventBus;

    fn subscribe(&self) -> Option<Subscription> {
        self.event_bus().subscribe()
    }

    fn unsubscribe(&self, id: SubscriberId) {
        self.event_bus().unsubscribe(id);
    }

    async fn emit(&self, event: Event) -> usize {
        self.event_bus().emit(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventType, ServiceRecord};
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    fn record(port: u16) -> Event {
        Event::service_record(ServiceRecord::new("svc", "_x._tcp", port))
    }

    #[tokio::test]
    async fn emit_without_subscribers_delivers_nothing() {
        let bus = EventBus::new(1);
        assert_eq!(bus.emit(Event::new(EventType::ServerStarted)).await, 0);
    }

    #[tokio::test]
    async fn every_subscriber_gets_one_copy_in_order() {
        let bus = EventBus::new(8);
        let mut subs: Vec<_> = (0..3).map(|_| bus.subscribe().unwrap()).collect();

        for port in 1..=5 {
            assert_eq!(bus.emit(record(port)).await, 3);
        }

        for sub in &mut subs {
            for port in 1..=5 {
                let event = sub.recv().await.unwrap();
                assert_eq!(event.record().unwrap().port(), port);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn emit_waits_for_slow_subscriber() {
        let bus = EventBus::new(1);
        let mut sub = bus.subscribe().unwrap();

        bus.emit(record(1)).await;
        // The buffer is full, so the next emit must wait for a receive.
        let emitter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.emit(record(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!emitter.is_finished());

        assert_eq!(sub.recv().await.unwrap().record().unwrap().port(), 1);
        let delivered = timeout(Duration::from_secs(1), emitter).await.unwrap().unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(sub.recv().await.unwrap().record().unwrap().port(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_closes_subscription() {
        let bus = EventBus::new(4);
        let mut keep = bus.subscribe().unwrap();
        let mut gone = bus.subscribe().unwrap();

        bus.unsubscribe(gone.id());
        assert!(gone.is_closed());
        assert_eq!(gone.recv().await, None);

        assert_eq!(bus.emit(record(7)).await, 1);
        assert_eq!(keep.recv().await.unwrap().record().unwrap().port(), 7);
        assert_eq!(bus.subscriber_count(), 1);

        // Removing twice, or an id the bus never issued, is harmless.
        bus.unsubscribe(gone.id());
        bus.unsubscribe(SubscriberId(999));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unsubscribe_releases_blocked_emitter() {
        let bus = EventBus::new(1);
        let sub = bus.subscribe().unwrap();
        bus.emit(record(1)).await;

        let emitter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.emit(record(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.unsubscribe(sub.id());

        let delivered = timeout(Duration::from_secs(1), emitter).await.unwrap().unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn close_ends_streams_and_refuses_new_subscribers() {
        let bus = EventBus::new(2);
        let first = bus.subscribe().unwrap();
        let mut second = bus.subscribe().unwrap();

        bus.close();
        assert!(bus.is_closed());
        assert!(bus.subscribe().is_none());
        assert_eq!(second.recv().await, None);

        let collected: Vec<_> = timeout(Duration::from_secs(1), first.into_stream().collect())
            .await
            .unwrap();
        assert!(collected.is_empty());
        assert_eq!(bus.emit(record(1)).await, 0);

        // Closing again is a no-op.
        bus.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_emitters_keep_per_task_order_under_churn() {
        const EMITTERS: usize = 4;
        const PER_EMITTER: u16 = 50;
        let bus = EventBus::new(2);

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let mut sub = bus.subscribe().unwrap();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while seen.len() < EMITTERS * PER_EMITTER as usize {
                        let event = sub.recv().await.unwrap();
                        let record = event.record().unwrap();
                        seen.push((record.name().to_string(), record.port()));
                    }
                    seen
                })
            })
            .collect();

        let churn = {
            let bus = bus.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    let mut sub = bus.subscribe().unwrap();
                    let _ = timeout(Duration::from_millis(1), sub.recv()).await;
                    bus.unsubscribe(sub.id());
                    assert_eq!(sub.recv().await, None);
                    tokio::task::yield_now().await;
                }
            })
        };

        let emitters: Vec<_> = (0..EMITTERS)
            .map(|task| {
                let bus = bus.clone();
                tokio::spawn(async move {
                    for seq in 1..=PER_EMITTER {
                        let record = ServiceRecord::new(format!("task{task}"), "_x._tcp", seq);
                        bus.emit(Event::service_record(record)).await;
                    }
                })
            })
            .collect();

        timeout(Duration::from_secs(10), async {
            for emitter in emitters {
                emitter.await.unwrap();
            }
            churn.await.unwrap();
            for consumer in consumers {
                let seen = consumer.await.unwrap();
                assert_eq!(seen.len(), EMITTERS * PER_EMITTER as usize);
                for task in 0..EMITTERS {
                    let name = format!("task{task}");
                    let ports: Vec<u16> = seen
                        .iter()
                        .filter(|(n, _)| *n == name)
                        .map(|(_, port)| *port)
                        .collect();
                    assert_eq!(ports, (1..=PER_EMITTER).collect::<Vec<_>>());
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(bus.subscriber_count(), 3);
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned_on_emit() {
        let bus = EventBus::new(1);
        drop(bus.subscribe().unwrap());
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(bus.emit(record(1)).await, 0);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
