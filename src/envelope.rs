//! Message envelope codec for the shared topics.
//!
//! Every payload on a topic is a JSON envelope: `{id, type, timestamp, sender,
//! details}`. The codec validates the four header fields, dispatches on `type`
//! once, and hands downstream code a statically typed [`MessageKind`]. Detail
//! fields are individually defaulted, so a partially populated (or entirely
//! missing) `details` object still decodes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Errors from envelope decoding.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("envelope missing required field '{0}'")]
    MissingField(&'static str),
    #[error("envelope field '{0}' has the wrong type")]
    InvalidField(&'static str),
    #[error("unrecognized message type '{0}'")]
    UnknownType(String),
    #[error("invalid details for '{kind}': {reason}")]
    InvalidDetails { kind: &'static str, reason: String },
}

/// The common message wrapper carried over every topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Globally unique message id (UUID v4).
    pub id: String,
    /// Sender wall-clock time, unix milliseconds.
    pub timestamp: i64,
    /// Agent id of the sender.
    pub sender: String,
    /// Type-discriminated payload.
    pub kind: MessageKind,
}

impl Envelope {
    /// Build a fresh envelope with a new id and the current wall-clock time.
    pub fn new(sender: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            sender: sender.into(),
            kind,
        }
    }
}

/// One variant per message type the protocol recognizes.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    AgentInfo(AgentInfo),
    AgentVerification(AgentVerification),
    Request(RequestDetails),
    Response(ResponseDetails),
    RebalanceProposal(RebalanceProposal),
    RebalanceApproved(RebalanceApproved),
    RebalanceExecuted(RebalanceExecuted),
    RiskAlert(RiskAlert),
    PriceUpdate(PriceUpdate),
}

impl MessageKind {
    /// Wire name carried in the envelope's `type` field.
    pub fn type_name(&self) -> &'static str {
        match self {
            MessageKind::AgentInfo(_) => "agent_info",
            MessageKind::AgentVerification(_) => "agent_verification",
            MessageKind::Request(_) => "request",
            MessageKind::Response(_) => "response",
            MessageKind::RebalanceProposal(_) => "rebalance_proposal",
            MessageKind::RebalanceApproved(_) => "rebalance_approved",
            MessageKind::RebalanceExecuted(_) => "rebalance_executed",
            MessageKind::RiskAlert(_) => "risk_alert",
            MessageKind::PriceUpdate(_) => "price_update",
        }
    }
}

/// Periodic self-announcement on the registry topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AgentInfo {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub topic_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: String,
    /// Runtime counters piggybacked on the announcement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
}

/// Advisory verification verdict for a registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AgentVerification {
    #[serde(default)]
    pub verified_agent_id: String,
    #[serde(default)]
    pub verification_result: bool,
}

/// Correlated request sent to another agent's inbound topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RequestDetails {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

/// Reply to a previously sent request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResponseDetails {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub data: Value,
}

/// What caused a proposal to be raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProposalTrigger {
    #[default]
    Scheduled,
    PriceDeviation,
    RiskThreshold,
}

/// Weighted-allocation proposal published on the governance topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RebalanceProposal {
    #[serde(default)]
    pub proposal_id: String,
    #[serde(default)]
    pub new_weights: HashMap<String, f64>,
    #[serde(default)]
    pub trigger: ProposalTrigger,
    #[serde(default)]
    pub execute_after: i64,
    #[serde(default)]
    pub quorum: f64,
}

/// Approval vote outcome referencing a stored proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RebalanceApproved {
    #[serde(default)]
    pub proposal_id: String,
    #[serde(default)]
    pub approved_at: i64,
}

/// Execution receipt: balances before and after the ledger adjustments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RebalanceExecuted {
    #[serde(default)]
    pub proposal_id: String,
    #[serde(default)]
    pub pre_balances: HashMap<String, f64>,
    #[serde(default)]
    pub post_balances: HashMap<String, f64>,
    #[serde(default)]
    pub executed_at: i64,
}

/// Market risk signal feeding the governance triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RiskAlert {
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub affected_tokens: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// A single observed price for one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PriceUpdate {
    #[serde(default, alias = "token_id")]
    pub asset: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub source: String,
}

/// Decode a raw topic payload into a typed envelope.
///
/// Header fields (`id`, `type`, `timestamp`, `sender`) are required and
/// type-checked; `details` may be absent, null, or partial.
pub fn decode(raw: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| DecodeError::Malformed("expected a JSON object".to_string()))?;

    let id = string_field(obj, "id")?;
    let type_name = string_field(obj, "type")?;
    let timestamp = integer_field(obj, "timestamp")?;
    let sender = string_field(obj, "sender")?;

    let details = match obj.get("details") {
        None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
        Some(other) => other.clone(),
    };

    let kind = decode_kind(&type_name, details)?;
    Ok(Envelope {
        id,
        timestamp,
        sender,
        kind,
    })
}

/// Encode an envelope back into its wire form.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    let details = match &envelope.kind {
        MessageKind::AgentInfo(d) => serde_json::to_value(d)?,
        MessageKind::AgentVerification(d) => serde_json::to_value(d)?,
        MessageKind::Request(d) => serde_json::to_value(d)?,
        MessageKind::Response(d) => serde_json::to_value(d)?,
        MessageKind::RebalanceProposal(d) => serde_json::to_value(d)?,
        MessageKind::RebalanceApproved(d) => serde_json::to_value(d)?,
        MessageKind::RebalanceExecuted(d) => serde_json::to_value(d)?,
        MessageKind::RiskAlert(d) => serde_json::to_value(d)?,
        MessageKind::PriceUpdate(d) => serde_json::to_value(d)?,
    };

    let body = serde_json::json!({
        "id": envelope.id,
        "type": envelope.kind.type_name(),
        "timestamp": envelope.timestamp,
        "sender": envelope.sender,
        "details": details,
    });
    serde_json::to_vec(&body)
}

fn decode_kind(type_name: &str, details: Value) -> Result<MessageKind, DecodeError> {
    fn parse<T: serde::de::DeserializeOwned>(
        kind: &'static str,
        details: Value,
    ) -> Result<T, DecodeError> {
        serde_json::from_value(details).map_err(|e| DecodeError::InvalidDetails {
            kind,
            reason: e.to_string(),
        })
    }

    match type_name {
        "agent_info" => Ok(MessageKind::AgentInfo(parse("agent_info", details)?)),
        "agent_verification" => Ok(MessageKind::AgentVerification(parse(
            "agent_verification",
            details,
        )?)),
        "request" => Ok(MessageKind::Request(parse("request", details)?)),
        "response" => Ok(MessageKind::Response(parse("response", details)?)),
        "rebalance_proposal" => Ok(MessageKind::RebalanceProposal(parse(
            "rebalance_proposal",
            details,
        )?)),
        "rebalance_approved" => Ok(MessageKind::RebalanceApproved(parse(
            "rebalance_approved",
            details,
        )?)),
        "rebalance_executed" => Ok(MessageKind::RebalanceExecuted(parse(
            "rebalance_executed",
            details,
        )?)),
        "risk_alert" => Ok(MessageKind::RiskAlert(parse("risk_alert", details)?)),
        "price_update" => Ok(MessageKind::PriceUpdate(parse("price_update", details)?)),
        other => Err(DecodeError::UnknownType(other.to_string())),
    }
}

fn string_field(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<String, DecodeError> {
    match obj.get(field) {
        None => Err(DecodeError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(DecodeError::InvalidField(field)),
    }
}

fn integer_field(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<i64, DecodeError> {
    match obj.get(field) {
        None => Err(DecodeError::MissingField(field)),
        Some(v) => v.as_i64().ok_or(DecodeError::InvalidField(field)),
    }
}
