//! Per-counterparty connection handshake.
//!
//! Connection traffic rides the generic request/response kinds: an inbound
//! `request` with action `connection_request` opens the handshake, the reply
//! is a `response` whose data carries `connection_created`, and
//! `close_connection` tears the link down. A counterparty has at most one
//! non-closed connection; duplicates are absorbed without a second reply.

use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, EventBus, EventKind};
use crate::envelope::{self, Envelope, MessageKind, RequestDetails, ResponseDetails};
use crate::registry::AgentRegistry;
use crate::transport::Transport;

pub const CONNECTION_REQUEST_ACTION: &str = "connection_request";
pub const CLOSE_CONNECTION_ACTION: &str = "close_connection";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Requested,
    Established,
    Closed,
}

/// One link to a counterparty over a dedicated channel.
#[derive(Debug, Clone)]
pub struct Connection {
    pub counterparty_id: String,
    pub connection_topic_id: String,
    /// Unix milliseconds when the record was created.
    pub established_at: i64,
    pub status: ConnectionStatus,
}

struct ConnectionInner {
    agent_id: String,
    transport: Arc<dyn Transport>,
    bus: EventBus,
    registry: AgentRegistry,
    active: Mutex<HashMap<String, Connection>>,
    /// Closed connections, retained for diagnostics.
    closed: Mutex<Vec<Connection>>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

impl ConnectionManager {
    pub fn new(
        agent_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        bus: EventBus,
        registry: AgentRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                agent_id: agent_id.into(),
                transport,
                bus,
                registry,
                active: Mutex::new(HashMap::new()),
                closed: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register the bus handler that drives the handshake.
    pub fn attach(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.bus.subscribe(
            EventKind::MessageReceived,
            Arc::new(move |event| {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    if let BusEvent::MessageReceived(envelope) = event {
                        if let MessageKind::Request(request) = &envelope.kind {
                            match request.action.as_str() {
                                CONNECTION_REQUEST_ACTION => {
                                    inner
                                        .handle_connection_request(&envelope.sender, request)
                                        .await;
                                }
                                CLOSE_CONNECTION_ACTION => {
                                    inner.handle_close(&envelope.sender, request).await;
                                }
                                _ => {}
                            }
                        }
                    }
                })
            }),
        );
    }

    /// The non-closed connection for a counterparty, if any.
    pub fn active_connection(&self, counterparty_id: &str) -> Option<Connection> {
        self.inner.active.lock().unwrap().get(counterparty_id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.lock().unwrap().len()
    }

    /// Closed-connection audit log.
    pub fn closed_log(&self) -> Vec<Connection> {
        self.inner.closed.lock().unwrap().clone()
    }
}

impl ConnectionInner {
    async fn handle_connection_request(&self, counterparty_id: &str, request: &RequestDetails) {
        if counterparty_id.is_empty() || counterparty_id == self.agent_id {
            return;
        }

        {
            let active = self.active.lock().unwrap();
            if let Some(existing) = active.get(counterparty_id) {
                // Idempotent: the original reply stands for the duplicate too.
                debug!(
                    counterparty = %counterparty_id,
                    status = ?existing.status,
                    "duplicate connection request absorbed"
                );
                return;
            }
        }

        // Reuse a channel proposed by the requester, otherwise create one.
        let proposed = request
            .data
            .get("connection_topic_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        let connection_topic_id = match proposed {
            Some(topic) => topic,
            None => match self.transport.create_channel().await {
                Ok(topic) => topic,
                Err(e) => {
                    warn!(counterparty = %counterparty_id, error = %e, "connection channel creation failed");
                    return;
                }
            },
        };

        self.active.lock().unwrap().insert(
            counterparty_id.to_string(),
            Connection {
                counterparty_id: counterparty_id.to_string(),
                connection_topic_id: connection_topic_id.clone(),
                established_at: chrono::Utc::now().timestamp_millis(),
                status: ConnectionStatus::Requested,
            },
        );
        info!(counterparty = %counterparty_id, topic = %connection_topic_id, "connection requested");

        // The handshake reply goes to the counterparty's inbound channel; the
        // connection stays Requested until it is actually sent.
        let Some(reply_topic) = self.registry.topic_for(counterparty_id) else {
            warn!(counterparty = %counterparty_id, "counterparty not in registry, handshake reply deferred");
            return;
        };

        let reply = Envelope::new(
            self.agent_id.clone(),
            MessageKind::Response(ResponseDetails {
                request_id: request.request_id.clone(),
                data: json!({
                    "op": "connection_created",
                    "requester_id": counterparty_id,
                    "connection_topic_id": connection_topic_id,
                }),
            }),
        );
        let payload = match envelope::encode(&reply) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode connection reply");
                return;
            }
        };
        if let Err(e) = self.transport.publish(&reply_topic, payload).await {
            warn!(counterparty = %counterparty_id, error = %e, "handshake reply publish failed");
            return;
        }

        if let Some(connection) = self.active.lock().unwrap().get_mut(counterparty_id) {
            connection.status = ConnectionStatus::Established;
        }
        info!(counterparty = %counterparty_id, "connection established");
        self.bus
            .publish(BusEvent::ConnectionEstablished {
                counterparty_id: counterparty_id.to_string(),
                connection_topic_id,
            })
            .await;
    }

    async fn handle_close(&self, counterparty_id: &str, request: &RequestDetails) {
        let reason = request
            .data
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("unspecified")
            .to_string();

        let removed = self.active.lock().unwrap().remove(counterparty_id);
        match removed {
            Some(mut connection) => {
                connection.status = ConnectionStatus::Closed;
                self.closed.lock().unwrap().push(connection);
                info!(counterparty = %counterparty_id, reason = %reason, "connection closed");
                self.bus
                    .publish(BusEvent::ConnectionClosed {
                        counterparty_id: counterparty_id.to_string(),
                        reason,
                    })
                    .await;
            }
            None => {
                debug!(counterparty = %counterparty_id, "close for unknown connection ignored");
            }
        }
    }
}
