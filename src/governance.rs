//! Governance state machine.
//!
//! Turns market signals into weighted-allocation proposals and walks each
//! proposal through `Proposed -> Approved -> Executed`, or `Proposed ->
//! Expired` when no approval arrives in time. Proposals are retained forever;
//! replayed approvals for settled proposals are no-ops.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, EventBus, EventKind};
use crate::config::Config;
use crate::envelope::{
    self, Envelope, MessageKind, PriceUpdate, ProposalTrigger, RebalanceApproved,
    RebalanceExecuted, RebalanceProposal, RiskAlert,
};
use crate::rebalance::{ExecutionError, RebalanceExecutor};
use crate::transport::Transport;
use crate::weights::WeightStrategy;

/// Emergency weight pinned on each affected token during a high-severity
/// risk response; the remainder is spread over the unaffected tokens.
const RISK_AFFECTED_WEIGHT: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalStatus {
    Proposed,
    Approved,
    Executed,
    Expired,
}

/// A stored weighted-allocation proposal.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub proposal_id: String,
    pub new_weights: HashMap<String, f64>,
    pub trigger: ProposalTrigger,
    pub created_at: i64,
    pub execute_after: i64,
    pub quorum: f64,
    pub status: ProposalStatus,
}

impl Proposal {
    pub fn weights_sum(&self) -> f64 {
        self.new_weights.values().sum()
    }

    /// Well-formedness check: non-negative weights summing to 1 within
    /// tolerance. Never enforced at creation: malformed weights are stored
    /// and flagged here for callers that care.
    pub fn weights_are_normalized(&self, tolerance: f64) -> bool {
        self.new_weights.values().all(|w| *w >= 0.0)
            && (self.weights_sum() - 1.0).abs() <= tolerance
    }
}

struct GovernanceInner {
    agent_id: String,
    governance_topic: String,
    proposal_timeout: Duration,
    rebalance_threshold: f64,
    quorum: f64,
    transport: Arc<dyn Transport>,
    bus: EventBus,
    strategy: Box<dyn WeightStrategy>,
    executor: RebalanceExecutor,
    proposals: Mutex<HashMap<String, Proposal>>,
    /// Per-asset price captured at the last executed rebalance.
    baselines: Mutex<HashMap<String, f64>>,
    /// Latest observed price per asset; doubles as the known-token universe.
    prices: Mutex<HashMap<String, f64>>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct GovernanceEngine {
    inner: Arc<GovernanceInner>,
}

impl GovernanceEngine {
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        bus: EventBus,
        strategy: Box<dyn WeightStrategy>,
        executor: RebalanceExecutor,
    ) -> Self {
        Self {
            inner: Arc::new(GovernanceInner {
                agent_id: config.agent_id.clone(),
                governance_topic: config.topics.governance.clone(),
                proposal_timeout: Duration::from_millis(config.governance.proposal_timeout_ms),
                rebalance_threshold: config.governance.rebalance_threshold,
                quorum: config.governance.quorum,
                transport,
                bus,
                strategy,
                executor,
                proposals: Mutex::new(HashMap::new()),
                baselines: Mutex::new(HashMap::new()),
                prices: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register the bus handler that feeds the trigger pipeline.
    pub fn attach(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.bus.subscribe(
            EventKind::MessageReceived,
            Arc::new(move |event| {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    if let BusEvent::MessageReceived(envelope) = event {
                        match envelope.kind {
                            MessageKind::PriceUpdate(update) => {
                                Arc::clone(&inner).handle_price_update(update).await;
                            }
                            MessageKind::RiskAlert(alert) => {
                                Arc::clone(&inner).handle_risk_alert(alert).await;
                            }
                            MessageKind::RebalanceApproved(approved) => {
                                inner.handle_approved(approved).await;
                            }
                            _ => {}
                        }
                    }
                })
            }),
        );
    }

    /// Raise a proposal directly (the external-request path).
    pub async fn propose_rebalance(
        &self,
        new_weights: HashMap<String, f64>,
        trigger: ProposalTrigger,
    ) -> Proposal {
        Arc::clone(&self.inner)
            .create_proposal(new_weights, trigger)
            .await
    }

    pub fn proposal(&self, proposal_id: &str) -> Option<Proposal> {
        self.inner.proposals.lock().unwrap().get(proposal_id).cloned()
    }

    pub fn proposals_snapshot(&self) -> HashMap<String, Proposal> {
        self.inner.proposals.lock().unwrap().clone()
    }

    /// The price baseline the deviation trigger compares against.
    pub fn baseline(&self, asset: &str) -> Option<f64> {
        self.inner.baselines.lock().unwrap().get(asset).copied()
    }

    pub fn is_executing(&self) -> bool {
        self.inner.executor.is_executing()
    }

    /// Cancel all outstanding expiry timers. Stored proposals stay readable.
    pub fn shutdown(&self) {
        let mut timers = self.inner.timers.lock().unwrap();
        for (_, timer) in timers.drain() {
            timer.abort();
        }
        debug!(agent_id = %self.inner.agent_id, "proposal timers cancelled");
    }
}

impl GovernanceInner {
    async fn handle_price_update(self: Arc<Self>, update: PriceUpdate) {
        if update.asset.is_empty() || update.price <= 0.0 {
            debug!(asset = %update.asset, price = update.price, "unusable price update dropped");
            return;
        }

        self.prices
            .lock()
            .unwrap()
            .insert(update.asset.clone(), update.price);

        let deviation = {
            let mut baselines = self.baselines.lock().unwrap();
            match baselines.get(&update.asset).copied() {
                None => {
                    // First sighting seeds the baseline without triggering.
                    baselines.insert(update.asset.clone(), update.price);
                    return;
                }
                Some(baseline) => (update.price - baseline).abs() / baseline,
            }
        };

        if deviation <= self.rebalance_threshold {
            return;
        }
        if self.has_open_proposal() {
            debug!(asset = %update.asset, deviation = deviation, "deviation noted, proposal already open");
            return;
        }

        info!(
            asset = %update.asset,
            price = update.price,
            deviation = deviation,
            threshold = self.rebalance_threshold,
            "price deviation trigger"
        );
        let weights = {
            let prices = self.prices.lock().unwrap().clone();
            self.strategy.target_weights(&prices)
        };
        self.create_proposal(weights, ProposalTrigger::PriceDeviation)
            .await;
    }

    async fn handle_risk_alert(self: Arc<Self>, alert: RiskAlert) {
        if alert.severity != "high" {
            debug!(severity = %alert.severity, "risk alert below the response threshold");
            return;
        }

        let affected: HashSet<&str> = alert
            .affected_tokens
            .iter()
            .map(|t| t.as_str())
            .filter(|t| !t.is_empty())
            .collect();
        if affected.is_empty() {
            debug!("high risk alert without affected tokens ignored");
            return;
        }

        // The token universe is everything priced so far plus the alert's own
        // tokens; affected tokens are pinned low and the rest split the
        // remaining allocation evenly.
        let mut universe: HashSet<String> = self.prices.lock().unwrap().keys().cloned().collect();
        for token in &affected {
            universe.insert((*token).to_string());
        }

        let unaffected_count = universe.len() - affected.len();
        let spread = if unaffected_count > 0 {
            (1.0 - RISK_AFFECTED_WEIGHT * affected.len() as f64).max(0.0)
                / unaffected_count as f64
        } else {
            warn!("every known token is affected, emergency weights cover affected only");
            0.0
        };

        let weights: HashMap<String, f64> = universe
            .into_iter()
            .map(|token| {
                let weight = if affected.contains(token.as_str()) {
                    RISK_AFFECTED_WEIGHT
                } else {
                    spread
                };
                (token, weight)
            })
            .collect();

        info!(
            affected = ?alert.affected_tokens,
            description = %alert.description,
            "high severity risk trigger"
        );
        self.create_proposal(weights, ProposalTrigger::RiskThreshold)
            .await;
    }

    async fn create_proposal(
        self: Arc<Self>,
        new_weights: HashMap<String, f64>,
        trigger: ProposalTrigger,
    ) -> Proposal {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let proposal = Proposal {
            proposal_id: Uuid::new_v4().to_string(),
            new_weights,
            trigger,
            created_at: now_ms,
            execute_after: now_ms,
            quorum: self.quorum,
            status: ProposalStatus::Proposed,
        };
        if !proposal.weights_are_normalized(1e-6) {
            // Stored and published regardless; well-formedness is advisory.
            warn!(
                proposal_id = %proposal.proposal_id,
                weights_sum = proposal.weights_sum(),
                "proposal weights are not normalized"
            );
        }

        self.proposals
            .lock()
            .unwrap()
            .insert(proposal.proposal_id.clone(), proposal.clone());
        info!(proposal_id = %proposal.proposal_id, trigger = ?trigger, "proposal created");

        let timer = {
            let inner = Arc::clone(&self);
            let proposal_id = proposal.proposal_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(inner.proposal_timeout).await;
                inner.expire(&proposal_id).await;
            })
        };
        self.timers
            .lock()
            .unwrap()
            .insert(proposal.proposal_id.clone(), timer);

        let envelope = Envelope::new(
            self.agent_id.clone(),
            MessageKind::RebalanceProposal(RebalanceProposal {
                proposal_id: proposal.proposal_id.clone(),
                new_weights: proposal.new_weights.clone(),
                trigger,
                execute_after: proposal.execute_after,
                quorum: proposal.quorum,
            }),
        );
        self.publish_governance(envelope, "proposal").await;

        self.bus
            .publish(BusEvent::ProposalCreated {
                proposal_id: proposal.proposal_id.clone(),
                trigger,
            })
            .await;
        proposal
    }

    async fn handle_approved(&self, approved: RebalanceApproved) {
        let proposal = {
            let mut proposals = self.proposals.lock().unwrap();
            match proposals.get_mut(&approved.proposal_id) {
                None => {
                    warn!(proposal_id = %approved.proposal_id, "approval for unknown proposal ignored");
                    return;
                }
                Some(proposal) => match proposal.status {
                    ProposalStatus::Executed | ProposalStatus::Approved => {
                        debug!(proposal_id = %proposal.proposal_id, "duplicate approval ignored");
                        return;
                    }
                    ProposalStatus::Expired => {
                        debug!(proposal_id = %proposal.proposal_id, "approval for expired proposal ignored");
                        return;
                    }
                    ProposalStatus::Proposed => {
                        proposal.status = ProposalStatus::Approved;
                        proposal.clone()
                    }
                },
            }
        };

        if let Some(timer) = self.timers.lock().unwrap().remove(&proposal.proposal_id) {
            timer.abort();
        }
        info!(proposal_id = %proposal.proposal_id, approved_at = approved.approved_at, "proposal approved");
        self.bus
            .publish(BusEvent::ProposalApproved {
                proposal_id: proposal.proposal_id.clone(),
            })
            .await;

        match self
            .executor
            .execute(&proposal.proposal_id, &proposal.new_weights)
            .await
        {
            Ok(receipt) => {
                if let Some(stored) = self
                    .proposals
                    .lock()
                    .unwrap()
                    .get_mut(&proposal.proposal_id)
                {
                    stored.status = ProposalStatus::Executed;
                }
                // The next deviation is measured from the post-rebalance market.
                {
                    let prices = self.prices.lock().unwrap().clone();
                    *self.baselines.lock().unwrap() = prices;
                }

                let envelope = Envelope::new(
                    self.agent_id.clone(),
                    MessageKind::RebalanceExecuted(RebalanceExecuted {
                        proposal_id: receipt.proposal_id.clone(),
                        pre_balances: receipt.pre_balances,
                        post_balances: receipt.post_balances,
                        executed_at: receipt.executed_at,
                    }),
                );
                self.publish_governance(envelope, "execution receipt").await;

                info!(proposal_id = %proposal.proposal_id, "rebalance executed");
                self.bus
                    .publish(BusEvent::RebalanceExecuted {
                        proposal_id: proposal.proposal_id.clone(),
                    })
                    .await;
            }
            Err(ExecutionError::AlreadyExecuting) => {
                warn!(proposal_id = %proposal.proposal_id, "execution deferred: another rebalance in flight");
            }
            Err(e) => {
                warn!(proposal_id = %proposal.proposal_id, error = %e, "execution failed, proposal stays approved");
            }
        }
    }

    async fn expire(&self, proposal_id: &str) {
        let expired = {
            let mut proposals = self.proposals.lock().unwrap();
            match proposals.get_mut(proposal_id) {
                Some(proposal) if proposal.status == ProposalStatus::Proposed => {
                    proposal.status = ProposalStatus::Expired;
                    true
                }
                _ => false,
            }
        };
        self.timers.lock().unwrap().remove(proposal_id);

        if expired {
            warn!(proposal_id = %proposal_id, "proposal expired without approval");
            self.bus
                .publish(BusEvent::ProposalExpired {
                    proposal_id: proposal_id.to_string(),
                })
                .await;
        }
    }

    fn has_open_proposal(&self) -> bool {
        self.proposals.lock().unwrap().values().any(|p| {
            matches!(
                p.status,
                ProposalStatus::Proposed | ProposalStatus::Approved
            )
        })
    }

    async fn publish_governance(&self, envelope: Envelope, what: &str) {
        match envelope::encode(&envelope) {
            Ok(payload) => {
                if let Err(e) = self.transport.publish(&self.governance_topic, payload).await {
                    warn!(error = %e, "failed to publish {what}");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode {what}"),
        }
    }
}
