//! Request/response correlation.
//!
//! Outbound requests are tracked in a keyed table (`request_id` → waiter).
//! Each timed request owns a timer task; whichever of response and timeout
//! settles first removes the entry under the table lock, which is the
//! complete-once decision point; the loser finds the entry gone and stands
//! down. Unrelated requests share nothing but the table lock.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, EventBus, EventKind};
use crate::config::Config;
use crate::envelope::{self, Envelope, MessageKind, RequestDetails, ResponseDetails};
use crate::registry::AgentRegistry;
use crate::transport::{PublishAck, Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("no registered agent '{0}'")]
    UnknownRecipient(String),
    #[error("request '{request_id}' timed out after {attempts} attempt(s)")]
    Timeout { request_id: String, attempts: u32 },
    #[error("request cancelled")]
    Cancelled,
    #[error("correlator shut down")]
    Shutdown,
    #[error("response channel dropped")]
    Dropped,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("request encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Per-request overrides for the configured defaults.
#[derive(Debug, Clone, Copy)]
pub struct RequestOptions {
    /// 0 means fire-and-forget: no timer, no pending entry.
    pub timeout_ms: u64,
    /// Resend attempts after the first timeout.
    pub max_retries: u32,
}

/// What `send_request` hands back: the id, plus (for timed requests) the
/// waiter for the correlated response.
#[derive(Debug)]
pub struct RequestHandle {
    pub request_id: String,
    receiver: Option<oneshot::Receiver<Result<Value, RequestError>>>,
}

impl RequestHandle {
    /// True when no response will ever be correlated (timeout of 0).
    pub fn is_fire_and_forget(&self) -> bool {
        self.receiver.is_none()
    }

    /// Await the correlated response. Fire-and-forget handles resolve
    /// immediately with `Value::Null`.
    pub async fn response(self) -> Result<Value, RequestError> {
        match self.receiver {
            None => Ok(Value::Null),
            Some(receiver) => receiver.await.unwrap_or(Err(RequestError::Dropped)),
        }
    }
}

struct PendingRequest {
    recipient_id: String,
    channel_id: String,
    /// Encoded request envelope, resent verbatim on retry.
    payload: Vec<u8>,
    waiter: oneshot::Sender<Result<Value, RequestError>>,
    timer: JoinHandle<()>,
    retries_remaining: u32,
    attempts: u32,
}

enum TimerVerdict {
    /// Entry already settled; the timer stands down.
    Settled,
    /// Budget left: resend and keep the timer running.
    Retry { channel_id: String, payload: Vec<u8> },
    /// Retries exhausted: fail the waiter.
    Expired {
        waiter: oneshot::Sender<Result<Value, RequestError>>,
        attempts: u32,
    },
}

struct CorrelatorInner {
    sender_id: String,
    defaults: RequestOptions,
    transport: Arc<dyn Transport>,
    registry: AgentRegistry,
    bus: EventBus,
    pending: Mutex<HashMap<String, PendingRequest>>,
    shut_down: AtomicBool,
}

#[derive(Clone)]
pub struct Correlator {
    inner: Arc<CorrelatorInner>,
}

impl Correlator {
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        registry: AgentRegistry,
        bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(CorrelatorInner {
                sender_id: config.agent_id.clone(),
                defaults: RequestOptions {
                    timeout_ms: config.requests.timeout_ms,
                    max_retries: config.requests.max_retries,
                },
                transport,
                registry,
                bus,
                pending: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Register the bus handler that correlates inbound responses.
    pub fn attach(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.bus.subscribe(
            EventKind::MessageReceived,
            Arc::new(move |event| {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    if let BusEvent::MessageReceived(envelope) = event {
                        if let MessageKind::Response(response) = envelope.kind {
                            inner.handle_response(response).await;
                        }
                    }
                })
            }),
        );
    }

    /// Send a correlated request to a registered agent.
    ///
    /// With a positive timeout the returned handle resolves on the matching
    /// response, or fails with `Timeout` once retries are exhausted. With a
    /// timeout of 0 nothing is tracked and the handle resolves immediately.
    pub async fn send_request(
        &self,
        recipient_id: &str,
        action: impl Into<String>,
        data: Value,
        options: Option<RequestOptions>,
    ) -> Result<RequestHandle, RequestError> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::SeqCst) {
            return Err(RequestError::Shutdown);
        }

        let options = options.unwrap_or(inner.defaults);
        let channel_id = inner
            .registry
            .topic_for(recipient_id)
            .ok_or_else(|| RequestError::UnknownRecipient(recipient_id.to_string()))?;

        let request_id = Uuid::new_v4().to_string();
        let envelope = Envelope::new(
            inner.sender_id.clone(),
            MessageKind::Request(RequestDetails {
                request_id: request_id.clone(),
                action: action.into(),
                data,
            }),
        );
        let payload = envelope::encode(&envelope)?;

        if options.timeout_ms == 0 {
            inner.transport.publish(&channel_id, payload).await?;
            debug!(request_id = %request_id, recipient = %recipient_id, "request published");
            return Ok(RequestHandle {
                request_id,
                receiver: None,
            });
        }

        // The entry goes into the table before the publish so a response
        // cannot outrun its own bookkeeping.
        let (waiter, receiver) = oneshot::channel();
        let timer = {
            let inner = Arc::clone(inner);
            let request_id = request_id.clone();
            let timeout = Duration::from_millis(options.timeout_ms);
            tokio::spawn(async move { run_timer(inner, request_id, timeout).await })
        };

        inner.pending.lock().unwrap().insert(
            request_id.clone(),
            PendingRequest {
                recipient_id: recipient_id.to_string(),
                channel_id: channel_id.clone(),
                payload: payload.clone(),
                waiter,
                timer,
                retries_remaining: options.max_retries,
                attempts: 1,
            },
        );

        if let Err(e) = inner.transport.publish(&channel_id, payload).await {
            if let Some(entry) = inner.pending.lock().unwrap().remove(&request_id) {
                entry.timer.abort();
            }
            return Err(e.into());
        }
        debug!(request_id = %request_id, recipient = %recipient_id, "request published");

        Ok(RequestHandle {
            request_id,
            receiver: Some(receiver),
        })
    }

    /// Publish a response envelope. Correlation bookkeeping lives entirely on
    /// the requester's side; this is a plain publish.
    pub async fn send_response(
        &self,
        request_id: impl Into<String>,
        recipient_id: &str,
        data: Value,
    ) -> Result<PublishAck, RequestError> {
        let inner = &self.inner;
        let channel_id = inner
            .registry
            .topic_for(recipient_id)
            .ok_or_else(|| RequestError::UnknownRecipient(recipient_id.to_string()))?;

        let envelope = Envelope::new(
            inner.sender_id.clone(),
            MessageKind::Response(ResponseDetails {
                request_id: request_id.into(),
                data,
            }),
        );
        let payload = envelope::encode(&envelope)?;
        Ok(inner.transport.publish(&channel_id, payload).await?)
    }

    /// Cancel one pending request; its waiter fails with `Cancelled`.
    pub fn cancel(&self, request_id: &str) -> bool {
        let entry = self.inner.pending.lock().unwrap().remove(request_id);
        match entry {
            Some(pending) => {
                pending.timer.abort();
                let _ = pending.waiter.send(Err(RequestError::Cancelled));
                debug!(request_id = %request_id, "request cancelled");
                true
            }
            None => false,
        }
    }

    /// Number of requests currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    /// Stop accepting requests, cancel all timers, and fail every pending
    /// waiter with `Shutdown`.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let drained: Vec<PendingRequest> = {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.drain().map(|(_, p)| p).collect()
        };
        for pending in drained {
            pending.timer.abort();
            let _ = pending.waiter.send(Err(RequestError::Shutdown));
        }
    }
}

impl CorrelatorInner {
    async fn handle_response(&self, response: ResponseDetails) {
        let entry = self.pending.lock().unwrap().remove(&response.request_id);
        match entry {
            Some(pending) => {
                pending.timer.abort();
                let _ = pending.waiter.send(Ok(response.data));
                debug!(
                    request_id = %response.request_id,
                    recipient = %pending.recipient_id,
                    "response correlated"
                );
                self.bus
                    .publish(BusEvent::ResponseReceived {
                        request_id: response.request_id,
                    })
                    .await;
            }
            None => {
                debug!(request_id = %response.request_id, "response for unknown or settled request");
            }
        }
    }

    /// Decide what a timer firing means. Runs entirely under the table lock;
    /// settlement elsewhere removes the entry first, so the decision is
    /// race-free.
    fn on_timer_fired(&self, request_id: &str) -> TimerVerdict {
        let mut pending = self.pending.lock().unwrap();
        let Some(entry) = pending.get_mut(request_id) else {
            return TimerVerdict::Settled;
        };
        if entry.retries_remaining > 0 {
            entry.retries_remaining -= 1;
            entry.attempts += 1;
            TimerVerdict::Retry {
                channel_id: entry.channel_id.clone(),
                payload: entry.payload.clone(),
            }
        } else {
            match pending.remove(request_id) {
                Some(entry) => TimerVerdict::Expired {
                    waiter: entry.waiter,
                    attempts: entry.attempts,
                },
                None => TimerVerdict::Settled,
            }
        }
    }
}

async fn run_timer(inner: Arc<CorrelatorInner>, request_id: String, timeout: Duration) {
    loop {
        tokio::time::sleep(timeout).await;
        match inner.on_timer_fired(&request_id) {
            TimerVerdict::Settled => break,
            TimerVerdict::Retry { channel_id, payload } => {
                inner
                    .bus
                    .publish(BusEvent::RequestTimeout {
                        request_id: request_id.clone(),
                        will_retry: true,
                    })
                    .await;
                // A failed resend is not fatal; the next timeout tries again.
                if let Err(e) = inner.transport.publish(&channel_id, payload).await {
                    warn!(request_id = %request_id, error = %e, "retry publish failed");
                } else {
                    debug!(request_id = %request_id, "request resent");
                }
            }
            TimerVerdict::Expired { waiter, attempts } => {
                warn!(request_id = %request_id, attempts = attempts, "request timed out");
                inner
                    .bus
                    .publish(BusEvent::RequestTimeout {
                        request_id: request_id.clone(),
                        will_retry: false,
                    })
                    .await;
                let _ = waiter.send(Err(RequestError::Timeout {
                    request_id,
                    attempts,
                }));
                break;
            }
        }
    }
}
