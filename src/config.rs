use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Unique agent identifier
    pub agent_id: String,

    /// Human-readable description announced with the agent info
    #[serde(default)]
    pub description: String,

    /// Capability tags advertised for discovery (e.g. "rebalancing")
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Topic ids for the shared channels
    #[serde(default)]
    pub topics: TopicsConfig,

    /// Discovery / re-registration timers
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Request correlation defaults
    #[serde(default)]
    pub requests: RequestConfig,

    /// Governance trigger thresholds and proposal lifecycle
    #[serde(default)]
    pub governance: GovernanceConfig,

    /// Rebalance execution tuning
    #[serde(default)]
    pub rebalance: RebalanceConfig,

    /// Target-weight strategy selection
    #[serde(default)]
    pub weights: WeightsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsConfig {
    /// Shared registry channel every agent announces on
    #[serde(default = "default_registry_topic")]
    pub registry: String,

    /// This agent's inbound channel; created via the transport when absent
    #[serde(default)]
    pub inbound: Option<String>,

    /// Shared governance channel for proposals, approvals and receipts
    #[serde(default = "default_governance_topic")]
    pub governance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// How often the agent re-announces itself
    #[serde(default = "default_reregistration_interval_ms")]
    pub reregistration_interval_ms: u64,

    /// How often the registry sweeps for stale peers
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,

    /// A peer is stale after `discovery_interval_ms * staleness_multiplier`
    /// without a re-announcement
    #[serde(default = "default_staleness_multiplier")]
    pub staleness_multiplier: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Default per-request timeout; 0 means fire-and-forget
    #[serde(default = "default_request_timeout_ms")]
    pub timeout_ms: u64,

    /// Default resend attempts after the first timeout
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// A proposal expires if unapproved for this long
    #[serde(default = "default_proposal_timeout_ms")]
    pub proposal_timeout_ms: u64,

    /// Relative price deviation from baseline that raises a proposal
    #[serde(default = "default_rebalance_threshold")]
    pub rebalance_threshold: f64,

    /// Approval-weight fraction recorded on each proposal
    #[serde(default = "default_quorum")]
    pub quorum: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceConfig {
    /// Adjustments smaller than this are skipped as not worth executing
    #[serde(default = "default_materiality_threshold")]
    pub materiality_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightsConfig {
    /// "equal" or "fixed"
    #[serde(default = "default_weight_strategy")]
    pub strategy: String,

    /// Target map used by the "fixed" strategy
    #[serde(default)]
    pub targets: HashMap<String, f64>,
}

fn default_registry_topic() -> String {
    "registry".to_string()
}

fn default_governance_topic() -> String {
    "governance".to_string()
}

fn default_reregistration_interval_ms() -> u64 {
    60_000
}

fn default_discovery_interval_ms() -> u64 {
    30_000
}

fn default_staleness_multiplier() -> u32 {
    3
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_proposal_timeout_ms() -> u64 {
    300_000
}

fn default_rebalance_threshold() -> f64 {
    0.05
}

fn default_quorum() -> f64 {
    0.51
}

fn default_materiality_threshold() -> f64 {
    1.0
}

fn default_weight_strategy() -> String {
    "equal".to_string()
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            registry: default_registry_topic(),
            inbound: None,
            governance: default_governance_topic(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            reregistration_interval_ms: default_reregistration_interval_ms(),
            discovery_interval_ms: default_discovery_interval_ms(),
            staleness_multiplier: default_staleness_multiplier(),
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            proposal_timeout_ms: default_proposal_timeout_ms(),
            rebalance_threshold: default_rebalance_threshold(),
            quorum: default_quorum(),
        }
    }
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            materiality_threshold: default_materiality_threshold(),
        }
    }
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            strategy: default_weight_strategy(),
            targets: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(agent_id = %config.agent_id, "configuration loaded");
        Ok(config)
    }

    /// Default configuration for a named agent (sandbox and tests)
    pub fn default_for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            description: String::new(),
            capabilities: vec!["rebalancing".to_string()],
            topics: TopicsConfig::default(),
            discovery: DiscoveryConfig::default(),
            requests: RequestConfig::default(),
            governance: GovernanceConfig::default(),
            rebalance: RebalanceConfig::default(),
            weights: WeightsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_for_agent() {
        let config = Config::default_for_agent("agent-1");
        assert_eq!(config.agent_id, "agent-1");
        assert_eq!(config.topics.registry, "registry");
        assert_eq!(config.topics.governance, "governance");
        assert!(config.topics.inbound.is_none());
        assert_eq!(config.discovery.reregistration_interval_ms, 60_000);
        assert_eq!(config.discovery.staleness_multiplier, 3);
        assert_eq!(config.requests.timeout_ms, 30_000);
        assert_eq!(config.requests.max_retries, 2);
        assert_eq!(config.governance.rebalance_threshold, 0.05);
        assert_eq!(config.rebalance.materiality_threshold, 1.0);
        assert_eq!(config.weights.strategy, "equal");
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config: Config = toml::from_str(r#"agent_id = "tiny""#).unwrap();
        assert_eq!(config.agent_id, "tiny");
        assert_eq!(config.discovery.discovery_interval_ms, 30_000);
        assert_eq!(config.governance.proposal_timeout_ms, 300_000);
        assert!(config.capabilities.is_empty());
    }

    #[test]
    fn test_full_toml_round_trip() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let toml_content = r#"
agent_id = "gov-agent-7"
description = "index governance"
capabilities = ["rebalancing", "pricing"]

[topics]
registry = "0.0.1001"
inbound = "0.0.1002"
governance = "0.0.1003"

[discovery]
reregistration_interval_ms = 15000
discovery_interval_ms = 5000
staleness_multiplier = 4

[requests]
timeout_ms = 10000
max_retries = 1

[governance]
proposal_timeout_ms = 60000
rebalance_threshold = 0.1
quorum = 0.66

[rebalance]
materiality_threshold = 2.5

[weights]
strategy = "fixed"

[weights.targets]
BTC = 0.5
ETH = 0.5
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::from_file(temp_file.path()).unwrap();
        assert_eq!(config.agent_id, "gov-agent-7");
        assert_eq!(config.capabilities.len(), 2);
        assert_eq!(config.topics.inbound.as_deref(), Some("0.0.1002"));
        assert_eq!(config.discovery.staleness_multiplier, 4);
        assert_eq!(config.requests.max_retries, 1);
        assert_eq!(config.governance.quorum, 0.66);
        assert_eq!(config.rebalance.materiality_threshold, 2.5);
        assert_eq!(config.weights.strategy, "fixed");
        assert_eq!(config.weights.targets.get("BTC"), Some(&0.5));
    }

    #[test]
    fn test_missing_agent_id_fails() {
        let result: Result<Config, _> = toml::from_str("description = \"nameless\"");
        assert!(result.is_err());
    }
}
