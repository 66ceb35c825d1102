//! In-process typed event bus.
//!
//! The connective fabric between the protocol side (registry, connections,
//! correlator) and the governance side. Dispatch is sequential on the
//! publishing task, in subscription order; there is no queue and no
//! backpressure. A panicking handler is isolated: it is caught and logged,
//! and the remaining handlers for the event still run.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tracing::error;

use crate::envelope::{Envelope, ProposalTrigger};

/// Events carried on the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A decoded envelope arrived from one of the subscribed topics.
    MessageReceived(Envelope),
    /// A verification verdict with a positive result was observed.
    AgentVerified { agent_id: String },
    /// A pending request's timer fired without a matching response.
    RequestTimeout { request_id: String, will_retry: bool },
    /// A pending request was settled by a matching response.
    ResponseReceived { request_id: String },
    ConnectionEstablished {
        counterparty_id: String,
        connection_topic_id: String,
    },
    ConnectionClosed {
        counterparty_id: String,
        reason: String,
    },
    ProposalCreated {
        proposal_id: String,
        trigger: ProposalTrigger,
    },
    ProposalApproved { proposal_id: String },
    ProposalExpired { proposal_id: String },
    RebalanceExecuted { proposal_id: String },
}

/// Subscription key, one per [`BusEvent`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageReceived,
    AgentVerified,
    RequestTimeout,
    ResponseReceived,
    ConnectionEstablished,
    ConnectionClosed,
    ProposalCreated,
    ProposalApproved,
    ProposalExpired,
    RebalanceExecuted,
}

impl BusEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BusEvent::MessageReceived(_) => EventKind::MessageReceived,
            BusEvent::AgentVerified { .. } => EventKind::AgentVerified,
            BusEvent::RequestTimeout { .. } => EventKind::RequestTimeout,
            BusEvent::ResponseReceived { .. } => EventKind::ResponseReceived,
            BusEvent::ConnectionEstablished { .. } => EventKind::ConnectionEstablished,
            BusEvent::ConnectionClosed { .. } => EventKind::ConnectionClosed,
            BusEvent::ProposalCreated { .. } => EventKind::ProposalCreated,
            BusEvent::ProposalApproved { .. } => EventKind::ProposalApproved,
            BusEvent::ProposalExpired { .. } => EventKind::ProposalExpired,
            BusEvent::RebalanceExecuted { .. } => EventKind::RebalanceExecuted,
        }
    }
}

pub type SubscriptionId = u64;

/// Boxed async event handler.
pub type EventHandler = Arc<dyn Fn(BusEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap a synchronous closure as an [`EventHandler`].
pub fn handler<F>(f: F) -> EventHandler
where
    F: Fn(BusEvent) + Send + Sync + 'static,
{
    Arc::new(move |event| {
        f(event);
        futures::future::ready(()).boxed()
    })
}

struct Registration {
    id: SubscriptionId,
    once: bool,
    handler: EventHandler,
}

#[derive(Default)]
struct BusState {
    next_id: SubscriptionId,
    handlers: HashMap<EventKind, Vec<Registration>>,
}

/// Explicitly constructed, passed-by-reference dispatcher. Cloning yields a
/// handle onto the same bus.
#[derive(Clone)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                next_id: 1,
                handlers: HashMap::new(),
            })),
        }
    }

    /// Register a handler for every future event of the given kind.
    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        self.register(kind, handler, false)
    }

    /// Register a handler that fires at most once. The subscription is removed
    /// before the handler runs, so a handler that re-publishes the same event
    /// cannot re-trigger itself.
    pub fn subscribe_once(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        self.register(kind, handler, true)
    }

    fn register(&self, kind: EventKind, handler: EventHandler, once: bool) -> SubscriptionId {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state
            .handlers
            .entry(kind)
            .or_default()
            .push(Registration { id, once, handler });
        id
    }

    /// Remove a subscription. Returns false if the id is unknown (already
    /// removed, or consumed by a once-subscription).
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock().unwrap();
        for registrations in state.handlers.values_mut() {
            let before = registrations.len();
            registrations.retain(|r| r.id != id);
            if registrations.len() < before {
                return true;
            }
        }
        false
    }

    /// Number of live subscriptions for a kind.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        let state = self.state.lock().unwrap();
        state.handlers.get(&kind).map_or(0, |v| v.len())
    }

    /// Dispatch an event to every subscriber of its kind, sequentially, in
    /// subscription order. Once-subscriptions are dropped from the table
    /// before any handler runs.
    pub async fn publish(&self, event: BusEvent) {
        let batch: Vec<(SubscriptionId, EventHandler)> = {
            let mut state = self.state.lock().unwrap();
            match state.handlers.get_mut(&event.kind()) {
                None => return,
                Some(registrations) => {
                    let batch = registrations
                        .iter()
                        .map(|r| (r.id, r.handler.clone()))
                        .collect();
                    registrations.retain(|r| !r.once);
                    batch
                }
            }
        };

        let kind = event.kind();
        for (id, handler) in batch {
            let event = event.clone();
            // The async block defers the handler call into the guarded future,
            // so a panic before the first await point is caught as well.
            let outcome = AssertUnwindSafe(async move { handler(event).await })
                .catch_unwind()
                .await;
            if outcome.is_err() {
                error!(subscription = id, event = ?kind, "event handler panicked, continuing dispatch");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted(counter: Arc<AtomicUsize>) -> EventHandler {
        handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn verified(agent_id: &str) -> BusEvent {
        BusEvent::AgentVerified {
            agent_id: agent_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventKind::AgentVerified, counted(count.clone()));
        bus.subscribe(EventKind::AgentVerified, counted(count.clone()));

        bus.publish(verified("a")).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        bus.publish(verified("b")).await;
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(verified("a")).await;
    }

    #[tokio::test]
    async fn test_kind_filtering() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventKind::AgentVerified, counted(count.clone()));

        bus.publish(BusEvent::ProposalApproved {
            proposal_id: "p1".to_string(),
        })
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispatch_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            bus.subscribe(
                EventKind::AgentVerified,
                handler(move |_| order.lock().unwrap().push(tag)),
            );
        }

        bus.publish(verified("a")).await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe(EventKind::AgentVerified, counted(count.clone()));

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.publish(verified("a")).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_dispatch() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            EventKind::AgentVerified,
            handler(|_| panic!("handler exploded")),
        );
        bus.subscribe(EventKind::AgentVerified, counted(count.clone()));

        bus.publish(verified("a")).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribe_once_fires_once() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe_once(EventKind::AgentVerified, counted(count.clone()));

        bus.publish(verified("a")).await;
        bus.publish(verified("b")).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(EventKind::AgentVerified), 0);
    }

    #[tokio::test]
    async fn test_subscribe_once_removed_before_handler_runs() {
        // A once-handler that re-publishes the same event must not see itself.
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let inner_bus = bus.clone();
        let inner_count = count.clone();
        bus.subscribe_once(
            EventKind::AgentVerified,
            Arc::new(move |event| {
                let bus = inner_bus.clone();
                let count = inner_count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    bus.publish(event).await;
                }
                .boxed()
            }),
        );

        bus.publish(verified("a")).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscriber_count() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(EventKind::MessageReceived), 0);
        let id = bus.subscribe(EventKind::MessageReceived, handler(|_| {}));
        bus.subscribe(EventKind::MessageReceived, handler(|_| {}));
        assert_eq!(bus.subscriber_count(EventKind::MessageReceived), 2);
        bus.unsubscribe(id);
        assert_eq!(bus.subscriber_count(EventKind::MessageReceived), 1);
    }
}
