use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lightweight record published on the shared metrics topic (retained).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Inferences per second across all sources.
    pub inference_throughput: f64,
    pub avg_latency_ms: f64,
    pub sources: Vec<SourceLatency>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceLatency {
    pub source_id: u32,
    pub latency_ms: f64,
}

/// Full report published on demand to the per-instance metrics subtopic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullMetricsReport {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub inference_throughput: f64,
    pub latency_reports: Vec<LatencyReport>,
    pub sources_metadata: Vec<SourceMetadata>,
    pub status_updates: Vec<SourceStatusUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyReport {
    pub source_id: u32,
    pub frame_decoding_latency_ms: f64,
    pub inference_latency_ms: f64,
    pub e2e_latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub source_id: u32,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatusUpdate {
    pub source_id: u32,
    pub severity: String,
    pub message: String,
}

impl MetricsSnapshot {
    /// Average latency over the per-source reports, 0 when empty.
    pub fn from_sources(
        timestamp: DateTime<Utc>,
        inference_throughput: f64,
        sources: Vec<SourceLatency>,
    ) -> Self {
        let avg_latency_ms = if sources.is_empty() {
            0.0
        } else {
            sources.iter().map(|s| s.latency_ms).sum::<f64>() / sources.len() as f64
        };
        Self {
            timestamp,
            inference_throughput,
            avg_latency_ms,
            sources,
        }
    }
}
