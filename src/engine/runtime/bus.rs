//! Deduplicating pub/sub bus for run events.
//!
//! Subscribers register per `(run, channel)` or for a channel across all
//! runs. Every publish builds a fresh envelope; identical publishes inside
//! the local window are dropped, and envelopes arriving from a transport are
//! deduplicated by id over a longer window.
//!
//! Each subscription owns a FIFO queue drained by its own task, so a handler
//! sees events in publish order and a slow or failing handler never holds up
//! another.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::dedup::DedupCache;
use super::transport::{BusTransport, transport_channel};
use crate::config::BusConfig;
use crate::engine::domain::events::RunEvent;

pub type EventHandler = Arc<dyn Fn(RunEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Routing key. `run_id: None` is the wildcard for a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub run_id: Option<String>,
    pub channel: String,
}

/// Returned by `subscribe`; pass it back to `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
    key: SubscriptionKey,
}

impl Subscription {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }
}

type HandlerTable = HashMap<SubscriptionKey, HashMap<u64, mpsc::UnboundedSender<RunEvent>>>;

pub struct EventBus {
    origin: String,
    ignore_own_origin: bool,
    local_dedup: DedupCache,
    remote_dedup: DedupCache,
    handlers: RwLock<HandlerTable>,
    next_subscription: AtomicU64,
    transport: RwLock<Option<Arc<dyn BusTransport>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("origin", &self.origin)
            .field("ignore_own_origin", &self.ignore_own_origin)
            .finish_non_exhaustive()
    }
}

/// Content fingerprint used for the local publish window.
pub fn fingerprint(run_id: &str, channel: &str, event_type: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    for part in [run_id, channel, event_type] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(payload.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

impl EventBus {
    pub fn new(config: &BusConfig) -> Self {
        let origin = config
            .origin
            .clone()
            .filter(|o| !o.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            origin,
            ignore_own_origin: config.ignore_own_origin,
            local_dedup: DedupCache::new(Duration::from_millis(config.local_dedup_ms), config.max_entries),
            remote_dedup: DedupCache::new(Duration::from_millis(config.remote_dedup_ms), config.max_entries),
            handlers: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            transport: RwLock::new(None),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Register `handler` and spawn the task that drains its queue. The task
    /// ends once the subscription is removed and its backlog is delivered.
    pub fn subscribe(&self, run_id: Option<&str>, channel: &str, handler: EventHandler) -> Subscription {
        let key = SubscriptionKey {
            run_id: run_id.map(str::to_string),
            channel: channel.to_string(),
        };
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);

        let (tx, mut rx) = mpsc::unbounded_channel::<RunEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let event_id = event.id.clone();
                if let Err(e) = handler(event).await {
                    tracing::warn!(event_id = %event_id, subscription = id, error = %e, "event handler failed");
                }
            }
        });

        self.handlers
            .write()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .insert(id, tx);
        Subscription { id, key }
    }

    /// `subscribe` for a plain async closure.
    pub fn subscribe_fn<F, Fut>(&self, run_id: Option<&str>, channel: &str, handler: F) -> Subscription
    where
        F: Fn(RunEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |event| Box::pin(handler(event)));
        self.subscribe(run_id, channel, handler)
    }

    /// Idempotent. Empty handler sets are dropped with their key.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut table = self.handlers.write().unwrap();
        let Some(set) = table.get_mut(&subscription.key) else {
            return false;
        };
        let removed = set.remove(&subscription.id).is_some();
        if set.is_empty() {
            table.remove(&subscription.key);
        }
        removed
    }

    pub fn handler_count(&self, run_id: Option<&str>, channel: &str) -> usize {
        let key = SubscriptionKey {
            run_id: run_id.map(str::to_string),
            channel: channel.to_string(),
        };
        self.handlers.read().unwrap().get(&key).map_or(0, HashMap::len)
    }

    pub fn subscription_keys(&self) -> usize {
        self.handlers.read().unwrap().len()
    }

    /// Publish a fresh envelope. Returns `None` when an identical event was
    /// published inside the local window.
    pub async fn publish(
        &self,
        run_id: &str,
        channel: &str,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Option<RunEvent> {
        let event_type = event_type.into();
        if !self
            .local_dedup
            .first_sighting(&fingerprint(run_id, channel, &event_type, &payload))
        {
            tracing::debug!(run_id, channel, event_type = %event_type, "duplicate publish suppressed");
            metrics::counter!("bus.deduplicated").increment(1);
            return None;
        }

        let event = RunEvent::new(&self.origin, event_type, run_id, channel, payload);
        // Our own envelope may come back through the transport.
        self.remote_dedup.first_sighting(&event.id);
        self.deliver(&event);
        metrics::counter!("bus.published").increment(1);

        let transport = self.transport.read().unwrap().clone();
        if let Some(transport) = transport {
            match serde_json::to_string(&event) {
                Ok(envelope) => {
                    if let Err(e) = transport
                        .publish(&transport_channel(run_id, channel), envelope)
                        .await
                    {
                        tracing::warn!(run_id, error = %e, "transport publish failed");
                    }
                }
                Err(e) => tracing::warn!(run_id, error = %e, "event serialization failed"),
            }
        }
        Some(event)
    }

    /// Deliver an envelope received from the transport. Malformed envelopes,
    /// repeats inside the remote window, and (optionally) our own echoes are
    /// dropped.
    pub fn ingest_remote(&self, raw: &str) -> Option<RunEvent> {
        let Some(event) = RunEvent::from_envelope(raw) else {
            tracing::warn!("dropping malformed bus envelope");
            metrics::counter!("bus.dropped_malformed").increment(1);
            return None;
        };
        if self.ignore_own_origin && event.origin == self.origin {
            return None;
        }
        if !self.remote_dedup.first_sighting(&event.id) {
            metrics::counter!("bus.deduplicated").increment(1);
            return None;
        }
        self.deliver(&event);
        Some(event)
    }

    /// Wire a transport: publishes are forwarded to it and envelopes it
    /// yields for `pattern` are ingested.
    pub fn attach_transport(
        self: &Arc<Self>,
        transport: Arc<dyn BusTransport>,
        pattern: &str,
    ) -> JoinHandle<()> {
        let mut incoming = transport.subscribe(pattern);
        *self.transport.write().unwrap() = Some(transport);

        let bus: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(message) = incoming.next().await {
                let Some(bus) = bus.upgrade() else {
                    break;
                };
                bus.ingest_remote(&message.envelope);
            }
        })
    }

    /// Push onto the queue of every run-scoped and wildcard subscriber.
    fn deliver(&self, event: &RunEvent) -> usize {
        let table = self.handlers.read().unwrap();
        let scoped = SubscriptionKey {
            run_id: Some(event.run_id.clone()),
            channel: event.channel.clone(),
        };
        let wildcard = SubscriptionKey {
            run_id: None,
            channel: event.channel.clone(),
        };
        [scoped, wildcard]
            .iter()
            .filter_map(|key| table.get(key))
            .flat_map(|set| set.values())
            .filter(|queue| queue.send(event.clone()).is_ok())
            .count()
    }
}

/// Unsubscribes when dropped.
#[derive(Debug)]
pub struct SubscriptionGuard {
    bus: Arc<EventBus>,
    subscription: Option<Subscription>,
}

impl SubscriptionGuard {
    pub fn new(bus: Arc<EventBus>, subscription: Subscription) -> Self {
        Self {
            bus,
            subscription: Some(subscription),
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.bus.unsubscribe(&subscription);
        }
    }
}
