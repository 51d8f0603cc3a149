//! In-process publish/subscribe hub decoupling protocol events from consumers.
//!
//! The bus is pure dispatch: it holds no reference to the transport, so
//! watchdogs and the orchestration loop can be exercised with synthetic
//! events. Handlers for one topic run in subscription order; a failing
//! handler never prevents delivery to the handlers behind it. Failures are
//! aggregated into the [`PublishReport`] returned to the publisher.

mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

pub use types::{BusEvent, ProtocolEvent, SignalKind, Topic, WatchdogSignal};

/// Error returned by a handler. Aggregated by [`EventBus::publish`]; never
/// unwinds the publish.
#[derive(Clone, Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Callback registered for a topic.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Short name used when reporting handler failures.
    fn name(&self) -> &str;

    async fn handle(&self, event: &BusEvent) -> Result<(), HandlerError>;
}

/// Opaque handle identifying one subscription.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SubscriptionId(u64);

/// One handler failure surfaced by a publish.
#[derive(Clone, Debug)]
pub struct HandlerFailure {
    pub handler: String,
    pub error: HandlerError,
}

/// Outcome of one publish: how many handlers saw the event, and which failed.
#[derive(Debug, Default)]
pub struct PublishReport {
    pub delivered: usize,
    pub failures: Vec<HandlerFailure>,
}

impl PublishReport {
    pub fn all_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Subscriber {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

/// Topic-keyed publish/subscribe hub.
///
/// Subscriber lists are guarded by a lock that is never held across an
/// await: `publish` snapshots the list for its topic, then invokes handlers
/// outside the lock, so concurrent `subscribe`/`unsubscribe` calls from
/// watchdog lifecycles interleave safely with event delivery.
pub struct EventBus {
    subscribers: RwLock<HashMap<Topic, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register `handler` for `topic`. Handlers run in subscription order.
    pub fn subscribe(&self, topic: Topic, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(topic)
            .or_default()
            .push(Subscriber { id, handler });
        id
    }

    /// Remove a subscription. Unknown or already-removed ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut map = self.subscribers.write();
        for subs in map.values_mut() {
            subs.retain(|sub| sub.id != id);
        }
    }

    /// Deliver `event` to every handler subscribed to its topic.
    ///
    /// Handler failures are collected, not propagated: the report lists every
    /// failure alongside the count of handlers that saw the event.
    pub async fn publish(&self, event: BusEvent) -> PublishReport {
        let topic = event.topic();
        let snapshot: Vec<Arc<dyn EventHandler>> = {
            let map = self.subscribers.read();
            map.get(&topic)
                .map(|subs| subs.iter().map(|sub| Arc::clone(&sub.handler)).collect())
                .unwrap_or_default()
        };

        let mut report = PublishReport::default();
        for handler in snapshot {
            report.delivered += 1;
            if let Err(error) = handler.handle(&event).await {
                debug!(
                    target: "bus",
                    handler = handler.name(),
                    %error,
                    ?topic,
                    "handler failed; continuing delivery"
                );
                report.failures.push(HandlerFailure {
                    handler: handler.name().to_string(),
                    error,
                });
            }
        }
        report
    }

    /// Number of live subscriptions for `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscribers
            .read()
            .get(&topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Subscribe with a channel instead of a handler, for consumers that want
    /// to `await` events. The forwarding handler is released by passing the
    /// returned id to [`EventBus::unsubscribe`]; once the receiver is dropped
    /// the forwarder discards events silently.
    pub fn subscribe_channel(
        &self,
        topic: Topic,
        capacity: usize,
    ) -> (SubscriptionId, mpsc::Receiver<BusEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.subscribe(topic, Arc::new(ChannelForwarder { tx }));
        (id, rx)
    }
}

struct ChannelForwarder {
    tx: mpsc::Sender<BusEvent>,
}

#[async_trait]
impl EventHandler for ChannelForwarder {
    fn name(&self) -> &str {
        "channel-forwarder"
    }

    async fn handle(&self, event: &BusEvent) -> Result<(), HandlerError> {
        // Receiver gone is not a delivery failure; the subscription just
        // lingers until its owner unsubscribes.
        let _ = self.tx.send(event.clone()).await;
        Ok(())
    }
}
