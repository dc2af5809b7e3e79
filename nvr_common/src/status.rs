use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state advertised on the retained per-instance status topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorStatus {
    Connected,
    Running,
    Paused,
    Reconfiguring,
    Stopped,
    Error,
}

impl ProcessorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorStatus::Connected => "connected",
            ProcessorStatus::Running => "running",
            ProcessorStatus::Paused => "paused",
            ProcessorStatus::Reconfiguring => "reconfiguring",
            ProcessorStatus::Stopped => "stopped",
            ProcessorStatus::Error => "error",
        }
    }
}

/// Retained status message; late subscribers receive the latest one on
/// subscribe without polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: ProcessorStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub instance_id: String,
}

impl StatusMessage {
    pub fn now(status: ProcessorStatus, instance_id: impl Into<String>) -> Self {
        Self {
            status,
            timestamp: Utc::now(),
            instance_id: instance_id.into(),
        }
    }
}

/// Discovery response to the `ping` command, non-retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {
    pub instance_id: String,
    pub model_id: String,
    pub stream_source_ids: Vec<u32>,
    pub status: ProcessorStatus,
}
