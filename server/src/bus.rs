//! Typed publish/subscribe event bus.
//!
//! The bus is the single entry point the producing system needs: it calls
//! [`EventBus::publish`] with an event type and a [`PublishRequest`], and every
//! local subscriber of that type is invoked synchronously, in publish order.
//!
//! # Cross-process fanout
//!
//! Delivery to other server instances is delegated to a [`Fanout`] strategy
//! chosen once at startup:
//!
//! - [`LocalFanout`] - single-instance mode, nothing leaves the process
//! - [`RedisFanout`](crate::broker::RedisFanout) - republishes every event on
//!   a Redis channel and feeds remote events back into local delivery
//!
//! Without a broker, events published on one instance never reach sockets
//! connected to another instance.
//!
//! # Example
//!
//! ```rust
//! use darecast_server::bus::EventBus;
//! use darecast_server::types::PublishRequest;
//! use serde_json::json;
//! use std::sync::{Arc, Mutex};
//!
//! let bus = EventBus::local();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//!
//! let sink = Arc::clone(&seen);
//! let _subscription = bus.subscribe("dare.created", move |event| {
//!     sink.lock().unwrap().push(event.id.clone());
//! });
//!
//! bus.publish("dare.created", PublishRequest::for_resource("dare-1", json!({})));
//! assert_eq!(seen.lock().unwrap().len(), 1);
//! ```

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tracing::{error, trace, warn};
use uuid::Uuid;

use crate::broker::RedisFanout;
use crate::types::{Event, PublishRequest};

/// A subscriber callback. Handlers run on the publisher's task and must not block.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Strategy for delivering events beyond the local process.
pub trait Fanout: Send + Sync {
    /// Hands a locally published event to the remote transport.
    ///
    /// Must not block and must not fail; transport errors are logged by the
    /// implementation.
    fn forward(&self, event: &Event);

    /// Short name reported by the health endpoint.
    fn name(&self) -> &'static str;
}

/// Single-instance fanout: events never leave the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFanout;

impl Fanout for LocalFanout {
    fn forward(&self, _event: &Event) {}

    fn name(&self) -> &'static str {
        "local"
    }
}

struct Registered {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct Topics {
    by_type: HashMap<String, Vec<Registered>>,
    all: Vec<Registered>,
}

/// In-process handler table shared by the bus and the broker's inbound loop.
#[derive(Default)]
pub(crate) struct LocalDispatch {
    topics: RwLock<Topics>,
    next_id: AtomicU64,
}

impl LocalDispatch {
    fn add(&self, event_type: Option<String>, handler: Handler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        let registered = Registered { id, handler };
        match event_type {
            Some(event_type) => topics.by_type.entry(event_type).or_default().push(registered),
            None => topics.all.push(registered),
        }
        id
    }

    fn remove(&self, event_type: Option<&str>, id: u64) {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        match event_type {
            Some(event_type) => {
                if let Some(handlers) = topics.by_type.get_mut(event_type) {
                    handlers.retain(|registered| registered.id != id);
                    if handlers.is_empty() {
                        topics.by_type.remove(event_type);
                    }
                }
            }
            None => topics.all.retain(|registered| registered.id != id),
        }
    }

    /// Invokes every handler for the event's type, then every wildcard handler.
    ///
    /// Handlers are snapshotted before invocation so a handler may subscribe
    /// or unsubscribe without deadlocking. A panicking handler is logged and
    /// does not prevent delivery to the remaining handlers.
    pub(crate) fn deliver(&self, event: &Event) -> usize {
        let handlers: Vec<Handler> = {
            let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
            topics
                .by_type
                .get(&event.event_type)
                .into_iter()
                .flatten()
                .chain(topics.all.iter())
                .map(|registered| Arc::clone(&registered.handler))
                .collect()
        };

        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Event handler panicked"
                );
            }
        }

        handlers.len()
    }

    fn handler_count(&self) -> usize {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics.by_type.values().map(Vec::len).sum::<usize>() + topics.all.len()
    }
}

/// Handle returned by [`EventBus::subscribe`]; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    dispatch: Weak<LocalDispatch>,
    event_type: Option<String>,
    id: u64,
}

impl Subscription {
    /// Removes the handler from the bus.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(dispatch) = self.dispatch.upgrade() {
            dispatch.remove(self.event_type.as_deref(), self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event_type", &self.event_type)
            .field("id", &self.id)
            .finish()
    }
}

/// Publish/subscribe hub. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    local: Arc<LocalDispatch>,
    fanout: Arc<dyn Fanout>,
    instance_id: Arc<str>,
}

impl EventBus {
    /// Creates a bus with in-process delivery only.
    #[must_use]
    pub fn local() -> Self {
        Self {
            local: Arc::new(LocalDispatch::default()),
            fanout: Arc::new(LocalFanout),
            instance_id: Uuid::new_v4().to_string().into(),
        }
    }

    /// Creates a bus that also fans out through the Redis broker at `url`.
    ///
    /// If the broker cannot be reached the failure is logged and the bus
    /// falls back to local-only delivery.
    pub async fn with_broker(url: &str) -> Self {
        let bus = Self::local();
        match RedisFanout::connect(url, &bus.instance_id, Arc::clone(&bus.local)).await {
            Ok(fanout) => Self {
                fanout: Arc::new(fanout),
                ..bus
            },
            Err(err) => {
                warn!(
                    error = %err,
                    "Event broker unavailable, falling back to local-only delivery"
                );
                bus
            }
        }
    }

    /// Creates the bus described by an optional broker URL.
    pub async fn from_broker_url(url: Option<&str>) -> Self {
        match url {
            Some(url) => Self::with_broker(url).await,
            None => Self::local(),
        }
    }

    /// Publishes an event of `event_type` and returns it.
    ///
    /// Never fails: local handlers always run, remote fanout problems are
    /// logged by the fanout strategy.
    pub fn publish(&self, event_type: impl Into<String>, request: PublishRequest) -> Event {
        let event = Event::new(event_type, request.resource_id, request.payload);
        self.publish_event(&event);
        event
    }

    /// Publishes an already constructed event. Returns the number of local
    /// handlers invoked.
    pub fn publish_event(&self, event: &Event) -> usize {
        let delivered = self.local.deliver(event);
        trace!(
            event_id = %event.id,
            event_type = %event.event_type,
            handlers = delivered,
            "Event published"
        );
        self.fanout.forward(event);
        delivered
    }

    /// Subscribes `handler` to events of one type.
    pub fn subscribe<F>(&self, event_type: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let id = self.local.add(Some(event_type.clone()), Arc::new(handler));
        Subscription {
            dispatch: Arc::downgrade(&self.local),
            event_type: Some(event_type),
            id,
        }
    }

    /// Subscribes `handler` to every event regardless of type.
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.local.add(None, Arc::new(handler));
        Subscription {
            dispatch: Arc::downgrade(&self.local),
            event_type: None,
            id,
        }
    }

    /// Number of registered handlers across all types.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.local.handler_count()
    }

    /// Name of the active fanout strategy.
    #[must_use]
    pub fn fanout_name(&self) -> &'static str {
        self.fanout.name()
    }

    /// Identifier of this process on the broker.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("instance_id", &self.instance_id)
            .field("fanout", &self.fanout.name())
            .field("handlers", &self.handler_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn collector() -> (Arc<Mutex<Vec<Event>>>, impl Fn(&Event) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |event: &Event| sink.lock().unwrap().push(event.clone()))
    }

    #[test]
    fn every_subscriber_receives_each_publish_once_in_order() {
        let bus = EventBus::local();
        let (first, first_handler) = collector();
        let (second, second_handler) = collector();
        let _a = bus.subscribe("dare.created", first_handler);
        let _b = bus.subscribe("dare.created", second_handler);

        let published: Vec<Event> = (0..50)
            .map(|i| {
                bus.publish(
                    "dare.created",
                    PublishRequest::for_resource(format!("dare-{}", i % 3), json!({ "n": i })),
                )
            })
            .collect();

        for seen in [first, second] {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), published.len());
            let ids: Vec<_> = seen.iter().map(|e| e.id.clone()).collect();
            let expected: Vec<_> = published.iter().map(|e| e.id.clone()).collect();
            assert_eq!(ids, expected);
        }
    }

    #[test]
    fn subscribers_only_receive_their_type() {
        let bus = EventBus::local();
        let (created, handler) = collector();
        let _sub = bus.subscribe("dare.created", handler);

        bus.publish("dare.resolved", PublishRequest::system_wide(json!({})));
        assert!(created.lock().unwrap().is_empty());
    }

    #[test]
    fn wildcard_subscriber_sees_every_type() {
        let bus = EventBus::local();
        let (all, handler) = collector();
        let _sub = bus.subscribe_all(handler);

        bus.publish("dare.created", PublishRequest::system_wide(json!({})));
        bus.publish("comment.created", PublishRequest::system_wide(json!({})));

        let types: Vec<_> = all
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type.clone())
            .collect();
        assert_eq!(types, vec!["dare.created", "comment.created"]);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = EventBus::local();
        let (seen, handler) = collector();
        let sub = bus.subscribe("dare.created", handler);
        assert_eq!(bus.handler_count(), 1);

        sub.unsubscribe();
        assert_eq!(bus.handler_count(), 0);

        bus.publish("dare.created", PublishRequest::system_wide(json!({})));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_handler_does_not_stop_delivery() {
        let bus = EventBus::local();
        let _bad = bus.subscribe("dare.created", |_event| panic!("handler failure"));
        let (seen, handler) = collector();
        let _good = bus.subscribe("dare.created", handler);

        let delivered = bus.publish_event(&Event::new("dare.created", None, json!({})));
        assert_eq!(delivered, 2);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn handler_may_unsubscribe_itself_during_delivery() {
        let bus = EventBus::local();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicU64::new(0));

        let handler_slot = Arc::clone(&slot);
        let handler_calls = Arc::clone(&calls);
        let sub = bus.subscribe("dare.created", move |_event| {
            handler_calls.fetch_add(1, Ordering::SeqCst);
            handler_slot.lock().unwrap().take();
        });
        *slot.lock().unwrap() = Some(sub);

        bus.publish("dare.created", PublishRequest::system_wide(json!({})));
        bus.publish("dare.created", PublishRequest::system_wide(json!({})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_returns_event_with_request_fields() {
        let bus = EventBus::local();
        let event = bus.publish(
            "dare.resolved",
            PublishRequest::for_resource("dare-7", json!({"outcome": "won"})),
        );

        assert_eq!(event.event_type, "dare.resolved");
        assert_eq!(event.resource_id.as_deref(), Some("dare-7"));
        assert_eq!(event.payload["outcome"], "won");
    }

    #[test]
    fn local_bus_reports_local_fanout() {
        let bus = EventBus::local();
        assert_eq!(bus.fanout_name(), "local");
        assert!(!bus.instance_id().is_empty());
    }

    #[tokio::test]
    async fn unreachable_broker_falls_back_to_local() {
        let bus = EventBus::with_broker("redis://127.0.0.1:1/").await;
        assert_eq!(bus.fanout_name(), "local");

        let (seen, handler) = collector();
        let _sub = bus.subscribe("dare.created", handler);
        bus.publish("dare.created", PublishRequest::system_wide(json!({})));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_broker_url_falls_back_to_local() {
        let bus = EventBus::from_broker_url(Some("not a url")).await;
        assert_eq!(bus.fanout_name(), "local");
    }
}
