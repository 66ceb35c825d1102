//! Agent registry and discovery.
//!
//! Owns the known-agent table. Two timers drive it: a re-registration loop
//! that publishes this agent's own `agent_info` on the shared registry topic,
//! and a discovery sweep that marks peers stale when they stop announcing.
//! Records are only ever marked `Expired`, never deleted, so the table doubles
//! as an audit trail.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, EventBus, EventKind};
use crate::config::Config;
use crate::envelope::{self, AgentInfo, AgentVerification, Envelope, MessageKind};
use crate::metrics::AgentMetrics;
use crate::transport::{Transport, TransportError};

/// Lifecycle of a discovered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Pending,
    Verified,
    Expired,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Verified => "verified",
            AgentStatus::Expired => "expired",
        }
    }
}

/// One row of the known-agent table.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub agent_id: String,
    pub topic_id: String,
    pub capabilities: BTreeSet<String>,
    pub description: String,
    pub status: AgentStatus,
    /// Wall-clock time of the last announcement, unix milliseconds.
    pub last_seen_at: i64,
    /// Monotonic sighting time driving the staleness sweep.
    last_seen: Instant,
}

#[derive(Default)]
struct AgentTable {
    /// Discovery insertion order of `records` keys.
    order: Vec<String>,
    records: HashMap<String, AgentRecord>,
}

struct RegistryInner {
    agent_id: String,
    description: String,
    capabilities: Vec<String>,
    registry_topic: String,
    configured_topic: Option<String>,
    reregistration_interval: Duration,
    discovery_interval: Duration,
    staleness_multiplier: u32,
    transport: Arc<dyn Transport>,
    bus: EventBus,
    metrics: Arc<Mutex<AgentMetrics>>,
    table: Mutex<AgentTable>,
    topic_id: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle onto the registry; cloning shares the same table and timers.
#[derive(Clone)]
pub struct AgentRegistry {
    inner: Arc<RegistryInner>,
}

impl AgentRegistry {
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        bus: EventBus,
        metrics: Arc<Mutex<AgentMetrics>>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                agent_id: config.agent_id.clone(),
                description: config.description.clone(),
                capabilities: config.capabilities.clone(),
                registry_topic: config.topics.registry.clone(),
                configured_topic: config.topics.inbound.clone(),
                reregistration_interval: Duration::from_millis(
                    config.discovery.reregistration_interval_ms,
                ),
                discovery_interval: Duration::from_millis(config.discovery.discovery_interval_ms),
                staleness_multiplier: config.discovery.staleness_multiplier,
                transport,
                bus,
                metrics,
                table: Mutex::new(AgentTable::default()),
                topic_id: Mutex::new(config.topics.inbound.clone()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register the bus handlers that feed the table.
    pub fn attach(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.bus.subscribe(
            EventKind::MessageReceived,
            Arc::new(move |event| {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    if let BusEvent::MessageReceived(envelope) = event {
                        match envelope.kind {
                            MessageKind::AgentInfo(info) => inner.upsert(info),
                            MessageKind::AgentVerification(v) => {
                                inner.handle_verification(v).await;
                            }
                            _ => {}
                        }
                    }
                })
            }),
        );
    }

    /// Ensure this agent has an inbound topic (creating one through the
    /// transport if none was configured, the registry's only channel
    /// creation) and start the announcement and sweep timers.
    pub async fn initialize(&self) -> Result<(), TransportError> {
        {
            let needs_topic = self.inner.topic_id.lock().unwrap().is_none();
            if needs_topic {
                let created = self.inner.transport.create_channel().await?;
                info!(topic = %created, "created inbound topic");
                *self.inner.topic_id.lock().unwrap() = Some(created);
            }
        }

        let announce = {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(inner.reregistration_interval);
                loop {
                    ticker.tick().await;
                    if let Err(e) = inner.announce().await {
                        warn!(error = %e, "self-announcement failed, will retry next tick");
                    }
                }
            })
        };

        let sweep = {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(inner.discovery_interval);
                loop {
                    ticker.tick().await;
                    inner.sweep_stale();
                }
            })
        };

        self.inner.tasks.lock().unwrap().extend([announce, sweep]);
        Ok(())
    }

    /// This agent's inbound topic id, if configured or already created.
    pub fn agent_topic_id(&self) -> Option<String> {
        self.inner
            .topic_id
            .lock()
            .unwrap()
            .clone()
            .or_else(|| self.inner.configured_topic.clone())
    }

    /// Resolve the inbound topic of a non-expired peer.
    pub fn topic_for(&self, agent_id: &str) -> Option<String> {
        let table = self.inner.table.lock().unwrap();
        table
            .records
            .get(agent_id)
            .filter(|r| r.status != AgentStatus::Expired)
            .map(|r| r.topic_id.clone())
    }

    /// All non-expired agents advertising a capability, in discovery order.
    pub fn find_agents_by_capability(&self, capability: &str) -> Vec<String> {
        let table = self.inner.table.lock().unwrap();
        table
            .order
            .iter()
            .filter_map(|id| table.records.get(id))
            .filter(|r| r.status != AgentStatus::Expired && r.capabilities.contains(capability))
            .map(|r| r.agent_id.clone())
            .collect()
    }

    /// Cloned snapshot of the whole table, expired rows included.
    pub fn snapshot(&self) -> HashMap<String, AgentRecord> {
        self.inner.table.lock().unwrap().records.clone()
    }

    /// Publish one self-announcement immediately.
    pub async fn announce_now(&self) -> Result<(), TransportError> {
        self.inner.announce().await
    }

    /// Run one staleness sweep immediately.
    pub fn sweep_now(&self) {
        self.inner.sweep_stale();
    }

    /// Cancel the announcement and sweep timers. The table stays readable.
    pub fn shutdown(&self) {
        let mut tasks = self.inner.tasks.lock().unwrap();
        for task in tasks.drain(..) {
            task.abort();
        }
        debug!(agent_id = %self.inner.agent_id, "registry timers cancelled");
    }
}

impl RegistryInner {
    async fn announce(&self) -> Result<(), TransportError> {
        let topic_id = self.topic_id.lock().unwrap().clone().unwrap_or_default();
        let metrics_value = serde_json::to_value(&*self.metrics.lock().unwrap()).ok();

        let envelope = Envelope::new(
            self.agent_id.clone(),
            MessageKind::AgentInfo(AgentInfo {
                agent_id: self.agent_id.clone(),
                topic_id,
                capabilities: self.capabilities.clone(),
                description: self.description.clone(),
                status: AgentStatus::Pending.as_str().to_string(),
                metrics: metrics_value,
            }),
        );

        let payload = envelope::encode(&envelope).map_err(|e| TransportError::Publish {
            channel: self.registry_topic.clone(),
            reason: e.to_string(),
        })?;
        let ack = self.transport.publish(&self.registry_topic, payload).await?;
        debug!(transaction = %ack.transaction_id, "self-announcement published");
        Ok(())
    }

    fn upsert(&self, info: AgentInfo) {
        if info.agent_id.is_empty() || info.agent_id == self.agent_id {
            return;
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut table = self.table.lock().unwrap();
        match table.records.get_mut(&info.agent_id) {
            Some(record) => {
                record.topic_id = info.topic_id;
                record.capabilities = info.capabilities.into_iter().collect();
                record.description = info.description;
                record.last_seen_at = now_ms;
                record.last_seen = Instant::now();
                if record.status == AgentStatus::Expired {
                    // A re-announcement revives an expired peer.
                    record.status = AgentStatus::Pending;
                    info!(agent_id = %record.agent_id, "expired agent re-announced");
                }
            }
            None => {
                info!(agent_id = %info.agent_id, topic = %info.topic_id, "discovered agent");
                table.order.push(info.agent_id.clone());
                table.records.insert(
                    info.agent_id.clone(),
                    AgentRecord {
                        agent_id: info.agent_id,
                        topic_id: info.topic_id,
                        capabilities: info.capabilities.into_iter().collect(),
                        description: info.description,
                        status: AgentStatus::Pending,
                        last_seen_at: now_ms,
                        last_seen: Instant::now(),
                    },
                );
            }
        }
    }

    /// Verification is advisory: observers get an event, the stored status is
    /// left untouched.
    async fn handle_verification(&self, verification: AgentVerification) {
        if !verification.verification_result {
            debug!(agent_id = %verification.verified_agent_id, "negative verification ignored");
            return;
        }
        self.bus
            .publish(BusEvent::AgentVerified {
                agent_id: verification.verified_agent_id,
            })
            .await;
    }

    fn sweep_stale(&self) {
        let threshold = self.discovery_interval * self.staleness_multiplier;
        let now = Instant::now();
        let mut table = self.table.lock().unwrap();
        for record in table.records.values_mut() {
            if record.status != AgentStatus::Expired
                && now.duration_since(record.last_seen) > threshold
            {
                warn!(agent_id = %record.agent_id, "agent expired (no re-announcement)");
                record.status = AgentStatus::Expired;
            }
        }
    }
}
