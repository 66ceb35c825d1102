use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Runtime counters reported with self-announcements
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AgentMetrics {
    pub messages_decoded: u64,
    pub messages_dropped: u64,
    pub requests_timed_out: u64,
    pub responses_received: u64,
    pub connections_established: u64,
    pub proposals_created: u64,
    pub proposals_executed: u64,
    pub custom: HashMap<String, f64>,
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_decoded(&mut self) {
        self.messages_decoded += 1;
    }

    pub fn record_dropped(&mut self) {
        self.messages_dropped += 1;
    }

    /// Set a custom metric
    pub fn set_custom(&mut self, key: impl Into<String>, value: f64) {
        self.custom.insert(key.into(), value);
    }

    /// Fraction of inbound payloads that decoded cleanly, as a percentage
    pub fn decode_rate(&self) -> f64 {
        let total = self.messages_decoded + self.messages_dropped;
        if total == 0 {
            return 100.0;
        }
        (self.messages_decoded as f64 / total as f64) * 100.0
    }
}
