use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use meshgov_agent::agent::Agent;
use meshgov_agent::bus::{self, BusEvent, EventKind};
use meshgov_agent::config::Config;
use meshgov_agent::envelope::{self, Envelope, MessageKind, RebalanceApproved};
use meshgov_agent::ledger::{Ledger, MemoryLedger};
use meshgov_agent::transport::{MemoryTransport, Transport};
use meshgov_agent::weights;

/// MeshGov Agent - governance agent runtime over append-only topics
#[derive(Parser, Debug)]
#[command(name = "meshgov-agent", version, about)]
struct Args {
    /// Agent ID (unique identifier)
    #[arg(short, long, default_value = "meshgov-sandbox")]
    id: String,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Interval between sandbox price ticks, in milliseconds
    #[arg(long, default_value_t = 2000)]
    tick_ms: u64,

    /// Per-tick price drift applied in the sandbox feed (fraction)
    #[arg(long, default_value_t = 0.02)]
    drift: f64,
}

/// The sandbox runs the full loop against the in-memory transport and ledger:
/// a drifting price feed trips the deviation trigger, and raised proposals are
/// approved straight from the governance topic so executions can be observed.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default_for_agent(args.id.clone()),
    };

    info!(agent_id = %config.agent_id, "MeshGov agent starting (sandbox transport)");

    let transport = Arc::new(MemoryTransport::new());
    let mut seed = std::collections::HashMap::new();
    seed.insert("BTC".to_string(), 600.0);
    seed.insert("ETH".to_string(), 400.0);
    let ledger = Arc::new(MemoryLedger::with_balances(seed));

    let strategy = weights::from_config(&config.weights);
    let governance_topic = config.topics.governance.clone();
    let agent_id = config.agent_id.clone();
    let agent = Agent::new(config, transport.clone(), ledger.clone(), strategy);
    agent.start().await?;

    // Sandbox auto-approval: counter-sign every proposal we raise.
    {
        let transport: Arc<dyn Transport> = transport.clone();
        let topic = governance_topic.clone();
        let approver = agent_id.clone();
        agent.bus().subscribe(
            EventKind::ProposalCreated,
            Arc::new(move |event| {
                let transport = transport.clone();
                let topic = topic.clone();
                let approver = approver.clone();
                Box::pin(async move {
                    let BusEvent::ProposalCreated { proposal_id, .. } = event else {
                        return;
                    };
                    let approval = Envelope::new(
                        format!("{approver}-sandbox-dao"),
                        MessageKind::RebalanceApproved(RebalanceApproved {
                            proposal_id,
                            approved_at: chrono::Utc::now().timestamp_millis(),
                        }),
                    );
                    match envelope::encode(&approval) {
                        Ok(payload) => {
                            if let Err(e) = transport.publish(&topic, payload).await {
                                warn!(error = %e, "sandbox approval publish failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "sandbox approval encode failed"),
                    }
                })
            }),
        );
    }

    agent.bus().subscribe(
        EventKind::RebalanceExecuted,
        bus::handler(|event| {
            if let BusEvent::RebalanceExecuted { proposal_id } = event {
                info!(proposal_id = %proposal_id, "sandbox rebalance executed");
            }
        }),
    );

    let mut ticker = tokio::time::interval(Duration::from_millis(args.tick_ms));
    let mut btc = 50_000.0f64;
    let mut eth = 3_000.0f64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                btc *= 1.0 + args.drift;
                eth *= 1.0 - args.drift / 2.0;
                agent.ingest_price("BTC", btc, "sandbox-feed").await;
                agent.ingest_price("ETH", eth, "sandbox-feed").await;

                let balances = ledger.get_balances().await?;
                info!(btc = btc, eth = eth, balances = ?balances, "sandbox tick");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                agent.shutdown().await;
                let metrics = agent.metrics_snapshot();
                info!(
                    decoded = metrics.messages_decoded,
                    dropped = metrics.messages_dropped,
                    proposals = metrics.proposals_created,
                    executions = metrics.proposals_executed,
                    "final counters"
                );
                break;
            }
        }
    }

    Ok(())
}
