//! Consumed transport interface: ordered, append-only pub/sub channels.
//!
//! The real channel fabric (consensus topics) lives outside this crate; the
//! agent only ever talks to the [`Transport`] trait. [`MemoryTransport`] is a
//! loopback implementation with the same ordering guarantees, used by the
//! sandbox run mode and the integration tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Buffered messages per in-memory subscriber before publish awaits.
const MEMORY_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("channel creation failed: {0}")]
    ChannelCreate(String),
    #[error("publish to '{channel}' failed: {reason}")]
    Publish { channel: String, reason: String },
    #[error("subscribe to '{channel}' failed: {reason}")]
    Subscribe { channel: String, reason: String },
}

/// Acknowledgement for a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub transaction_id: String,
}

/// The channel fabric the agent publishes to and subscribes on.
///
/// Ordering and delivery guarantees are the transport's own; nothing here
/// assumes exactly-once.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create a fresh channel and return its id.
    async fn create_channel(&self) -> Result<String, TransportError>;

    /// Append a payload to a channel.
    async fn publish(&self, channel_id: &str, payload: Vec<u8>) -> Result<PublishAck, TransportError>;

    /// Subscribe to a channel; messages arrive on the returned receiver in
    /// publish order. Dropping the receiver ends the subscription.
    async fn subscribe(&self, channel_id: &str) -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;
}

#[derive(Default)]
struct MemoryState {
    next_channel: u64,
    next_transaction: u64,
    subscribers: HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>,
}

/// In-memory loopback transport. Channel ids are implicit: publishing or
/// subscribing to any id is valid, matching a topic fabric where ids are
/// allocated externally.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on a channel.
    pub fn subscriber_count(&self, channel_id: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .subscribers
            .get(channel_id)
            .map_or(0, |subs| subs.iter().filter(|s| !s.is_closed()).count())
    }

    /// Total publishes acknowledged so far.
    pub fn publish_count(&self) -> u64 {
        self.state.lock().unwrap().next_transaction
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn create_channel(&self) -> Result<String, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.next_channel += 1;
        let id = format!("topic-{}", state.next_channel);
        debug!(channel = %id, "created in-memory channel");
        Ok(id)
    }

    async fn publish(&self, channel_id: &str, payload: Vec<u8>) -> Result<PublishAck, TransportError> {
        let (transaction_id, targets) = {
            let mut state = self.state.lock().unwrap();
            state.next_transaction += 1;
            let transaction_id = format!("txn-{}", state.next_transaction);
            let targets: Vec<mpsc::Sender<Vec<u8>>> = state
                .subscribers
                .get(channel_id)
                .map(|subs| subs.iter().filter(|s| !s.is_closed()).cloned().collect())
                .unwrap_or_default();
            (transaction_id, targets)
        };

        for target in targets {
            // A receiver dropped mid-send is indistinguishable from one that
            // unsubscribed; ignore it.
            let _ = target.send(payload.clone()).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(subs) = state.subscribers.get_mut(channel_id) {
            subs.retain(|s| !s.is_closed());
        }
        Ok(PublishAck { transaction_id })
    }

    async fn subscribe(&self, channel_id: &str) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let (tx, rx) = mpsc::channel(MEMORY_CHANNEL_CAPACITY);
        let mut state = self.state.lock().unwrap();
        state
            .subscribers
            .entry(channel_id.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
