use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wildcard accepted in `target_instances` to address every processor.
pub const TARGET_ALL: &str = "*";

pub type CommandParams = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed command payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A command received on the control topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command: String,
    #[serde(default, skip_serializing_if = "CommandParams::is_empty")]
    pub params: CommandParams,
    /// Absent means every instance. `"*"` is an explicit wildcard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_instances: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl CommandEnvelope {
    pub fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Whether this envelope addresses the given instance.
    pub fn addressed_to(&self, instance_id: &str) -> bool {
        match &self.target_instances {
            None => true,
            Some(targets) => targets
                .iter()
                .any(|t| t == TARGET_ALL || t == instance_id),
        }
    }
}

/// Best-effort command name from a payload that failed strict decoding,
/// so the error ack can still say which command was malformed.
pub fn peek_command_name(payload: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    value.get("command")?.as_str().map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Received,
    Completed,
    Error,
}

/// Acknowledgement published on the per-instance ack topic. Every accepted
/// command produces `received` followed by exactly one terminal ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub command: String,
    pub ack_status: AckStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}
