use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshgov_agent::agent::Agent;
use meshgov_agent::bus::{self, BusEvent, EventKind};
use meshgov_agent::config::Config;
use meshgov_agent::connection::CONNECTION_REQUEST_ACTION;
use meshgov_agent::correlator::{RequestError, RequestOptions};
use meshgov_agent::envelope::{
    self, Envelope, MessageKind, RebalanceApproved, RiskAlert,
};
use meshgov_agent::governance::ProposalStatus;
use meshgov_agent::ledger::{Ledger, MemoryLedger};
use meshgov_agent::registry::AgentStatus;
use meshgov_agent::transport::{MemoryTransport, Transport};
use meshgov_agent::weights::EqualWeights;

/// Give pump tasks and timers a chance to drain under the paused clock.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Run one full announcement round so freshly started agents see each other.
async fn let_discover() {
    settle().await;
    tokio::time::advance(Duration::from_millis(5_100)).await;
    settle().await;
}

fn test_config(agent_id: &str) -> Config {
    let mut config = Config::default_for_agent(agent_id);
    config.description = format!("integration fixture {agent_id}");
    config.topics.inbound = Some(format!("inbound-{agent_id}"));
    config.discovery.reregistration_interval_ms = 5_000;
    config.discovery.discovery_interval_ms = 3_000;
    config.discovery.staleness_multiplier = 3;
    config.governance.proposal_timeout_ms = 120_000;
    config
}

fn build_agent(
    agent_id: &str,
    transport: Arc<MemoryTransport>,
    balances: &[(&str, f64)],
) -> (Agent, Arc<MemoryLedger>) {
    let ledger = Arc::new(MemoryLedger::with_balances(
        balances
            .iter()
            .map(|(a, v)| (a.to_string(), *v))
            .collect::<HashMap<_, _>>(),
    ));
    let agent = Agent::new(
        test_config(agent_id),
        transport,
        ledger.clone(),
        Box::new(EqualWeights),
    );
    (agent, ledger)
}

async fn publish_envelope(transport: &MemoryTransport, topic: &str, envelope: &Envelope) {
    transport
        .publish(topic, envelope::encode(envelope).unwrap())
        .await
        .unwrap();
}

/// Two agents on a shared fabric discover each other from the periodic
/// announcements alone.
#[tokio::test(start_paused = true)]
async fn test_agents_discover_each_other() {
    let transport = Arc::new(MemoryTransport::new());
    let (alpha, _) = build_agent("alpha", transport.clone(), &[]);
    let (beta, _) = build_agent("beta", transport.clone(), &[]);

    alpha.start().await.unwrap();
    beta.start().await.unwrap();
    let_discover().await;

    let alpha_view = alpha.registry().snapshot();
    let beta_view = beta.registry().snapshot();
    assert_eq!(alpha_view.get("beta").unwrap().status, AgentStatus::Pending);
    assert_eq!(beta_view.get("alpha").unwrap().status, AgentStatus::Pending);
    assert_eq!(
        alpha.registry().topic_for("beta").unwrap(),
        "inbound-beta"
    );

    // Capability search sees the announced tags.
    assert_eq!(
        alpha.registry().find_agents_by_capability("rebalancing"),
        vec!["beta".to_string()]
    );

    alpha.shutdown().await;
    beta.shutdown().await;
}

/// A silent peer expires after the staleness window but revives on its next
/// announcement.
#[tokio::test(start_paused = true)]
async fn test_silent_peer_expires_and_revives() {
    let transport = Arc::new(MemoryTransport::new());
    let (alpha, _) = build_agent("alpha", transport.clone(), &[]);
    let (beta, _) = build_agent("beta", transport.clone(), &[]);

    alpha.start().await.unwrap();
    beta.start().await.unwrap();
    let_discover().await;

    // Beta goes quiet; alpha keeps sweeping.
    beta.shutdown().await;
    tokio::time::advance(Duration::from_millis(10_000)).await;
    settle().await;

    assert_eq!(
        alpha.registry().snapshot().get("beta").unwrap().status,
        AgentStatus::Expired
    );
    assert!(alpha.registry().topic_for("beta").is_none());

    // One fresh announcement brings it back.
    beta.registry().announce_now().await.unwrap();
    settle().await;
    assert_eq!(
        alpha.registry().snapshot().get("beta").unwrap().status,
        AgentStatus::Pending
    );

    alpha.shutdown().await;
}

/// Correlated request/response across two agents: beta echoes, alpha's
/// pending request settles, and the bookkeeping empties out.
#[tokio::test(start_paused = true)]
async fn test_request_response_round_trip() {
    let transport = Arc::new(MemoryTransport::new());
    let (alpha, _) = build_agent("alpha", transport.clone(), &[]);
    let (beta, _) = build_agent("beta", transport.clone(), &[]);

    alpha.start().await.unwrap();
    beta.start().await.unwrap();
    let_discover().await;

    // Beta answers any "echo" request with the payload it was sent.
    let responder = beta.correlator().clone();
    beta.bus().subscribe(
        EventKind::MessageReceived,
        Arc::new(move |event| {
            let responder = responder.clone();
            Box::pin(async move {
                let BusEvent::MessageReceived(envelope) = event else {
                    return;
                };
                if let MessageKind::Request(request) = envelope.kind {
                    if request.action == "echo" {
                        responder
                            .send_response(
                                request.request_id,
                                &envelope.sender,
                                json!({"echoed": request.data}),
                            )
                            .await
                            .unwrap();
                    }
                }
            })
        }),
    );

    let handle = alpha
        .send_request(
            "beta",
            "echo",
            json!({"n": 7}),
            Some(RequestOptions {
                timeout_ms: 30_000,
                max_retries: 0,
            }),
        )
        .await
        .unwrap();
    settle().await;

    let value = handle.response().await.unwrap();
    assert_eq!(value["echoed"]["n"], 7);
    assert_eq!(alpha.correlator().in_flight(), 0);
    assert_eq!(alpha.metrics_snapshot().responses_received, 1);

    alpha.shutdown().await;
    beta.shutdown().await;
}

/// An unanswered request times out on schedule and surfaces to the caller.
#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out() {
    let transport = Arc::new(MemoryTransport::new());
    let (alpha, _) = build_agent("alpha", transport.clone(), &[]);
    let (beta, _) = build_agent("beta", transport.clone(), &[]);

    alpha.start().await.unwrap();
    beta.start().await.unwrap();
    let_discover().await;

    let handle = alpha
        .send_request(
            "beta",
            "ignored",
            Value::Null,
            Some(RequestOptions {
                timeout_ms: 30_000,
                max_retries: 0,
            }),
        )
        .await
        .unwrap();

    tokio::time::advance(Duration::from_millis(31_000)).await;
    settle().await;

    assert!(matches!(
        handle.response().await.unwrap_err(),
        RequestError::Timeout { .. }
    ));
    assert_eq!(alpha.metrics_snapshot().requests_timed_out, 1);

    alpha.shutdown().await;
    beta.shutdown().await;
}

/// Duplicate connection requests from the same counterparty produce exactly
/// one stored connection and exactly one connection_created reply.
#[tokio::test(start_paused = true)]
async fn test_connection_handshake_is_idempotent() {
    let transport = Arc::new(MemoryTransport::new());
    let (alpha, _) = build_agent("alpha", transport.clone(), &[]);
    let (beta, _) = build_agent("beta", transport.clone(), &[]);

    alpha.start().await.unwrap();
    beta.start().await.unwrap();
    let_discover().await;

    // Count connection_created replies arriving at alpha.
    let replies = Arc::new(AtomicUsize::new(0));
    let counter = replies.clone();
    alpha.bus().subscribe(
        EventKind::MessageReceived,
        bus::handler(move |event| {
            if let BusEvent::MessageReceived(envelope) = event {
                if let MessageKind::Response(response) = envelope.kind {
                    if response.data["op"] == "connection_created" {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        }),
    );

    for _ in 0..2 {
        alpha
            .send_request(
                "beta",
                CONNECTION_REQUEST_ACTION,
                Value::Null,
                Some(RequestOptions {
                    timeout_ms: 0,
                    max_retries: 0,
                }),
            )
            .await
            .unwrap();
        settle().await;
    }

    assert_eq!(beta.connections().active_count(), 1);
    let connection = beta.connections().active_connection("alpha").unwrap();
    assert_eq!(replies.load(Ordering::SeqCst), 1);
    assert!(!connection.connection_topic_id.is_empty());
    assert_eq!(beta.metrics_snapshot().connections_established, 1);

    alpha.shutdown().await;
    beta.shutdown().await;
}

/// The whole governance loop: a drifting price raises a proposal, an external
/// approval executes it against the ledger, and a replayed approval is a
/// no-op.
#[tokio::test(start_paused = true)]
async fn test_price_trigger_approval_execution() {
    let transport = Arc::new(MemoryTransport::new());
    let (agent, ledger) = build_agent("gov", transport.clone(), &[("BTC", 100.0), ("ETH", 900.0)]);
    agent.start().await.unwrap();

    let proposal_ids = Arc::new(Mutex::new(Vec::new()));
    let sink = proposal_ids.clone();
    agent.bus().subscribe(
        EventKind::ProposalCreated,
        bus::handler(move |event| {
            if let BusEvent::ProposalCreated { proposal_id, .. } = event {
                sink.lock().unwrap().push(proposal_id);
            }
        }),
    );
    let executions = Arc::new(AtomicUsize::new(0));
    let counter = executions.clone();
    agent.bus().subscribe(
        EventKind::RebalanceExecuted,
        bus::handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    // Seed baselines, then push BTC 20% off baseline.
    agent.ingest_price("BTC", 50_000.0, "feed").await;
    agent.ingest_price("ETH", 3_000.0, "feed").await;
    agent.ingest_price("BTC", 60_000.0, "feed").await;
    settle().await;

    let proposal_id = {
        let ids = proposal_ids.lock().unwrap();
        assert_eq!(ids.len(), 1);
        ids[0].clone()
    };
    assert_eq!(
        agent.governance().proposal(&proposal_id).unwrap().status,
        ProposalStatus::Proposed
    );

    // An external approver counter-signs on the governance topic.
    let approval = Envelope::new(
        "index-dao",
        MessageKind::RebalanceApproved(RebalanceApproved {
            proposal_id: proposal_id.clone(),
            approved_at: 1_700_000_000_000,
        }),
    );
    publish_envelope(&transport, "governance", &approval).await;
    settle().await;

    assert_eq!(
        agent.governance().proposal(&proposal_id).unwrap().status,
        ProposalStatus::Executed
    );
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    let balances = ledger.get_balances().await.unwrap();
    assert_eq!(balances.get("BTC"), Some(&500.0));
    assert_eq!(balances.get("ETH"), Some(&500.0));

    // Replayed approval: still exactly one execution.
    publish_envelope(&transport, "governance", &approval).await;
    settle().await;
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(agent.metrics_snapshot().proposals_executed, 1);

    agent.shutdown().await;
}

/// A high-severity risk alert over a two-token universe pins the affected
/// token to 0.1 and gives the rest to the survivor.
#[tokio::test(start_paused = true)]
async fn test_risk_alert_emergency_proposal() {
    let transport = Arc::new(MemoryTransport::new());
    let (agent, _ledger) = build_agent("gov", transport.clone(), &[("X", 500.0), ("Y", 500.0)]);
    agent.start().await.unwrap();

    agent.ingest_price("X", 10.0, "feed").await;
    agent.ingest_price("Y", 20.0, "feed").await;

    let alert = Envelope::new(
        "risk-sentinel",
        MessageKind::RiskAlert(RiskAlert {
            severity: "high".to_string(),
            affected_tokens: vec!["X".to_string()],
            description: "depeg watch".to_string(),
        }),
    );
    publish_envelope(&transport, "governance", &alert).await;
    settle().await;

    let proposals = agent.governance().proposals_snapshot();
    assert_eq!(proposals.len(), 1);
    let proposal = proposals.values().next().unwrap();
    assert_eq!(proposal.new_weights.get("X"), Some(&0.1));
    assert_eq!(proposal.new_weights.get("Y"), Some(&0.9));

    // Sub-"high" severities never propose.
    let mild = Envelope::new(
        "risk-sentinel",
        MessageKind::RiskAlert(RiskAlert {
            severity: "medium".to_string(),
            affected_tokens: vec!["Y".to_string()],
            description: String::new(),
        }),
    );
    publish_envelope(&transport, "governance", &mild).await;
    settle().await;
    assert_eq!(agent.governance().proposals_snapshot().len(), 1);

    agent.shutdown().await;
}

/// Shutdown cancels every timer: no announcements, sweeps, request timeouts,
/// or proposal expiries fire afterwards, and tables remain inspectable.
#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_all_timers() {
    let transport = Arc::new(MemoryTransport::new());
    let (alpha, _) = build_agent("alpha", transport.clone(), &[("BTC", 100.0)]);
    let (beta, _) = build_agent("beta", transport.clone(), &[]);

    alpha.start().await.unwrap();
    beta.start().await.unwrap();
    let_discover().await;

    let timeouts = Arc::new(AtomicUsize::new(0));
    let counter = timeouts.clone();
    alpha.bus().subscribe(
        EventKind::RequestTimeout,
        bus::handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    // Leave a request in flight and a proposal open, then pull the plug.
    let handle = alpha
        .send_request(
            "beta",
            "never-answered",
            Value::Null,
            Some(RequestOptions {
                timeout_ms: 30_000,
                max_retries: 2,
            }),
        )
        .await
        .unwrap();
    alpha.ingest_price("BTC", 50_000.0, "feed").await;
    alpha.ingest_price("BTC", 60_000.0, "feed").await;
    settle().await;
    assert_eq!(alpha.governance().proposals_snapshot().len(), 1);

    alpha.shutdown().await;
    beta.shutdown().await;
    let published_before = transport.publish_count();

    tokio::time::advance(Duration::from_secs(600)).await;
    settle().await;

    // No timer survived: no timeouts, no re-announcements, no expiries.
    assert_eq!(timeouts.load(Ordering::SeqCst), 0);
    assert_eq!(transport.publish_count(), published_before);
    assert!(matches!(
        handle.response().await.unwrap_err(),
        RequestError::Shutdown
    ));
    let proposals = alpha.governance().proposals_snapshot();
    assert_eq!(
        proposals.values().next().unwrap().status,
        ProposalStatus::Proposed
    );

    // Tables are still readable for diagnostics.
    assert!(alpha.registry().snapshot().contains_key("beta"));
}
