//! Top-level agent wiring.
//!
//! One bus, one of each component, explicit dependency injection; the agent
//! is the only place that knows the whole graph. Inbound pumps decode raw
//! topic payloads and publish them as `MessageReceived`; everything downstream
//! hangs off the bus.

use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{self, BusEvent, EventBus, EventKind};
use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::correlator::{Correlator, RequestError, RequestHandle, RequestOptions};
use crate::envelope::{self, MessageKind, PriceUpdate};
use crate::governance::GovernanceEngine;
use crate::ledger::Ledger;
use crate::metrics::AgentMetrics;
use crate::rebalance::RebalanceExecutor;
use crate::registry::AgentRegistry;
use crate::transport::{Transport, TransportError};
use crate::weights::WeightStrategy;

pub struct Agent {
    config: Config,
    bus: EventBus,
    transport: Arc<dyn Transport>,
    registry: AgentRegistry,
    connections: ConnectionManager,
    correlator: Correlator,
    governance: GovernanceEngine,
    metrics: Arc<Mutex<AgentMetrics>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// Wire up an agent over the injected transport, ledger, and strategy.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        ledger: Arc<dyn Ledger>,
        strategy: Box<dyn WeightStrategy>,
    ) -> Self {
        let bus = EventBus::new();
        let metrics = Arc::new(Mutex::new(AgentMetrics::new()));

        let registry = AgentRegistry::new(&config, transport.clone(), bus.clone(), metrics.clone());
        let connections = ConnectionManager::new(
            config.agent_id.clone(),
            transport.clone(),
            bus.clone(),
            registry.clone(),
        );
        let correlator = Correlator::new(&config, transport.clone(), registry.clone(), bus.clone());
        let executor = RebalanceExecutor::new(ledger, config.rebalance.materiality_threshold);
        let governance = GovernanceEngine::new(
            &config,
            transport.clone(),
            bus.clone(),
            strategy,
            executor,
        );

        Self {
            config,
            bus,
            transport,
            registry,
            connections,
            correlator,
            governance,
            metrics,
            pumps: Mutex::new(Vec::new()),
        }
    }

    /// Attach every component to the bus, initialize the registry (timers,
    /// inbound topic), and start the inbound pumps.
    pub async fn start(&self) -> Result<(), TransportError> {
        self.registry.attach();
        self.connections.attach();
        self.correlator.attach();
        self.governance.attach();
        self.attach_metrics();

        self.registry.initialize().await?;

        let mut channels = vec![
            self.config.topics.registry.clone(),
            self.config.topics.governance.clone(),
        ];
        if let Some(inbound) = self.registry.agent_topic_id() {
            channels.push(inbound);
        }

        let mut spawned = Vec::new();
        for channel in channels {
            let receiver = self.transport.subscribe(&channel).await?;
            spawned.push(self.spawn_pump(channel, receiver));
        }
        self.pumps.lock().unwrap().extend(spawned);

        info!(agent_id = %self.config.agent_id, "agent started");
        Ok(())
    }

    fn spawn_pump(
        &self,
        channel: String,
        mut receiver: tokio::sync::mpsc::Receiver<Vec<u8>>,
    ) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            while let Some(raw) = receiver.recv().await {
                match envelope::decode(&raw) {
                    Ok(envelope) => {
                        metrics.lock().unwrap().record_decoded();
                        bus.publish(BusEvent::MessageReceived(envelope)).await;
                    }
                    Err(e) => {
                        // Malformed traffic is dropped, never propagated.
                        metrics.lock().unwrap().record_dropped();
                        warn!(channel = %channel, error = %e, "dropped undecodable message");
                    }
                }
            }
            debug!(channel = %channel, "inbound pump stopped");
        })
    }

    /// Bus-derived counters: the pump feeds decode counts directly, the rest
    /// are observed from component events.
    fn attach_metrics(&self) {
        let subscriptions: [(EventKind, fn(&mut AgentMetrics)); 5] = [
            (EventKind::RequestTimeout, |m| m.requests_timed_out += 1),
            (EventKind::ResponseReceived, |m| m.responses_received += 1),
            (EventKind::ConnectionEstablished, |m| {
                m.connections_established += 1
            }),
            (EventKind::ProposalCreated, |m| m.proposals_created += 1),
            (EventKind::RebalanceExecuted, |m| m.proposals_executed += 1),
        ];
        for (kind, update) in subscriptions {
            let metrics = self.metrics.clone();
            self.bus.subscribe(
                kind,
                bus::handler(move |event| {
                    // Retries emit their own timeout events; count only final ones.
                    if let BusEvent::RequestTimeout { will_retry: true, .. } = event {
                        return;
                    }
                    update(&mut metrics.lock().unwrap());
                }),
            );
        }
    }

    /// External market-data callback: feed one observed price into the
    /// governance pipeline.
    pub async fn ingest_price(&self, asset: &str, price: f64, source: &str) {
        let envelope = envelope::Envelope::new(
            self.config.agent_id.clone(),
            MessageKind::PriceUpdate(PriceUpdate {
                asset: asset.to_string(),
                price,
                source: source.to_string(),
            }),
        );
        self.bus.publish(BusEvent::MessageReceived(envelope)).await;
    }

    /// Send a correlated request to a registered agent.
    pub async fn send_request(
        &self,
        recipient_id: &str,
        action: impl Into<String>,
        data: serde_json::Value,
        options: Option<RequestOptions>,
    ) -> Result<RequestHandle, RequestError> {
        self.correlator
            .send_request(recipient_id, action, data, options)
            .await
    }

    /// Reply to a previously received request.
    pub async fn send_response(
        &self,
        request_id: impl Into<String>,
        recipient_id: &str,
        data: serde_json::Value,
    ) -> Result<(), RequestError> {
        self.correlator
            .send_response(request_id, recipient_id, data)
            .await?;
        Ok(())
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn governance(&self) -> &GovernanceEngine {
        &self.governance
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn metrics_snapshot(&self) -> AgentMetrics {
        self.metrics.lock().unwrap().clone()
    }

    /// Stop the pumps and cancel every component timer. Pending requests are
    /// settled with `Shutdown`; tables stay readable for diagnostics.
    pub async fn shutdown(&self) {
        for pump in self.pumps.lock().unwrap().drain(..) {
            pump.abort();
        }
        self.registry.shutdown();
        self.correlator.shutdown();
        self.governance.shutdown();
        info!(agent_id = %self.config.agent_id, "agent shut down");
    }
}
