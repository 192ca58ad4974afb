use async_trait::async_trait;
use convoy_core::{
    ConvoyResult, Event, EventPriority, EventType, WILDCARD_CHANNEL,
};
use convoy_store::{MessageStream, Store};
use futures_util::{Stream, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reacts to events delivered by [`EventBus::listen`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> ConvoyResult<()>;
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Typed stream of bus events for push transports.
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

struct Subscription {
    id: SubscriptionId,
    /// Empty means every event type.
    types: Vec<EventType>,
    handler: Arc<dyn EventHandler>,
}

impl Subscription {
    fn is_wildcard(&self) -> bool {
        self.types.is_empty()
    }

    fn matches(&self, event_type: EventType) -> bool {
        self.is_wildcard() || self.types.contains(&event_type)
    }
}

/// Publish/subscribe over the store's pub/sub channels.
///
/// Every event goes out on its type channel (`convoy:events:task.created`)
/// and on the wildcard channel, so a consumer subscribes to exactly one of
/// the two and never sees an event twice. Delivery is at most once per
/// subscriber connection; there is no replay.
pub struct EventBus {
    store: Arc<dyn Store>,
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Build and publish an event.
    pub async fn publish(
        &self,
        event_type: EventType,
        source_agent: &str,
        payload: serde_json::Value,
        task_id: Option<Uuid>,
        trace_id: Option<Uuid>,
        priority: Option<EventPriority>,
    ) -> ConvoyResult<Event> {
        let mut event = Event::new(event_type, source_agent, payload);
        event.task_id = task_id;
        if let Some(trace_id) = trace_id {
            event.trace_id = trace_id;
        }
        if let Some(priority) = priority {
            event.priority = priority;
        }
        self.publish_event(&event).await?;
        Ok(event)
    }

    /// Publish a prepared event. Returns the number of receivers reached.
    pub async fn publish_event(&self, event: &Event) -> ConvoyResult<usize> {
        let raw = event.to_json()?;
        let typed = self.store.publish(&event.event_type.channel(), &raw).await?;
        let wildcard = self.store.publish(WILDCARD_CHANNEL, &raw).await?;
        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            source = %event.source_agent,
            "Event published"
        );
        Ok(typed + wildcard)
    }

    /// Register `handler` for `event_types`. An empty list subscribes to
    /// every type.
    ///
    /// Subscriptions are read when [`EventBus::listen`] starts; register
    /// handlers before starting the listener.
    pub fn subscribe(
        &self,
        event_types: &[EventType],
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut types = event_types.to_vec();
        types.sort();
        types.dedup();
        self.subscriptions.write().push(Subscription { id, types, handler });
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Channels the listener needs for the current subscriptions: the
    /// wildcard alone if any handler wants everything, else the union of
    /// the type channels.
    fn channels(&self) -> Vec<String> {
        let subs = self.subscriptions.read();
        if subs.is_empty() {
            return Vec::new();
        }
        if subs.iter().any(Subscription::is_wildcard) {
            return vec![WILDCARD_CHANNEL.to_string()];
        }
        subs.iter()
            .flat_map(|s| s.types.iter().map(EventType::channel))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn handlers_for(&self, event_type: EventType) -> Vec<(SubscriptionId, Arc<dyn EventHandler>)> {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| s.matches(event_type))
            .map(|s| (s.id, Arc::clone(&s.handler)))
            .collect()
    }

    async fn dispatch(&self, raw: &str) {
        let event = match Event::from_json(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Skipping malformed event payload");
                return;
            }
        };
        for (id, handler) in self.handlers_for(event.event_type) {
            if let Err(e) = handler.handle(&event).await {
                warn!(
                    subscription = %id,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %e,
                    "Event handler failed"
                );
            }
        }
    }

    /// Deliver events to the registered handlers until `cancel` fires.
    ///
    /// Malformed payloads and handler errors are logged and skipped. The
    /// channel subscription is dropped on return.
    pub async fn listen(&self, cancel: CancellationToken) -> ConvoyResult<()> {
        let channels = self.channels();
        if channels.is_empty() {
            debug!("Event listener has no subscriptions, waiting for shutdown");
            cancel.cancelled().await;
            return Ok(());
        }

        let mut messages: MessageStream = self.store.subscribe(&channels).await?;
        info!(channels = ?channels, "Event listener started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                msg = messages.next() => match msg {
                    Some(msg) => self.dispatch(&msg.payload).await,
                    None => {
                        warn!("Event subscription closed by the store");
                        break;
                    }
                },
            }
        }
        info!("Event listener stopped");
        Ok(())
    }

    /// Stream of events of the given types (empty = every type).
    pub async fn stream(&self, event_types: &[EventType]) -> ConvoyResult<EventStream> {
        let channels: Vec<String> = if event_types.is_empty() {
            vec![WILDCARD_CHANNEL.to_string()]
        } else {
            event_types
                .iter()
                .map(EventType::channel)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        };
        let messages = self.store.subscribe(&channels).await?;
        let events = messages.filter_map(|msg| async move {
            match Event::from_json(&msg.payload) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(channel = %msg.channel, error = %e, "Dropping malformed event");
                    None
                }
            }
        });
        Ok(Box::pin(events))
    }
}
