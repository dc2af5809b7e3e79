//! The inference-pipeline capability.
//!
//! The detection engine is an external collaborator; the processor only
//! depends on this seam. A pipeline is constructed from a [`PipelineSpec`],
//! pushes predictions into the supplied callback from its own threads, and
//! is joined by the main loop until terminated or replaced.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use nvr_common::{Detection, LatencyReport, SourceMetadata, SourceStatusUpdate};

use crate::config::ProcessorConfig;
use crate::error::PipelineError;

pub mod synthetic;

/// Everything a pipeline needs to come up, derived from the live config at
/// (re)start time.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSpec {
    /// Resolved stream URIs, index-aligned with `source_ids`.
    pub video_references: Vec<String>,
    pub source_ids: Vec<u32>,
    pub model_id: String,
    /// 0 means unbounded.
    pub max_fps: f64,
}

impl PipelineSpec {
    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self {
            video_references: config
                .stream_source_ids
                .iter()
                .map(|id| config.video_reference(*id))
                .collect(),
            source_ids: config.stream_source_ids.clone(),
            model_id: config.model_id.clone(),
            max_fps: config.max_fps,
        }
    }
}

/// Identity of one frame as seen by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMeta {
    pub source_id: u32,
    pub frame_id: u64,
    /// Capture timestamp, not inference-completion time.
    pub timestamp: DateTime<Utc>,
}

/// One inference result delivered to the sink callback.
#[derive(Debug, Clone, PartialEq)]
pub struct FramePrediction {
    pub frame: FrameMeta,
    pub detections: Vec<Detection>,
    pub inference_time_ms: f64,
    pub fps: Option<f64>,
    pub latency_ms: Option<f64>,
}

/// Engine-side callback. Batched engines deliver several frames per call;
/// single-frame engines deliver a slice of one.
pub type PredictionCallback = Arc<dyn Fn(&[FramePrediction]) + Send + Sync>;

#[async_trait]
pub trait DetectionPipeline: Send + Sync {
    /// Bring all sources up. May block for tens of seconds while RTSP
    /// sources connect; callers must not assume it is fast.
    async fn start(&self) -> Result<(), PipelineError>;

    /// Stop buffering new frames. Frames already queued may still produce
    /// predictions for a while; the sink gate covers that window.
    fn pause_stream(&self);

    fn resume_stream(&self);

    /// Stop the pipeline. Idempotent.
    async fn terminate(&self);

    /// Resolve once the pipeline has fully exited.
    async fn join(&self);

    /// Inferences per second since start.
    fn throughput(&self) -> f64;

    fn latency_reports(&self) -> Vec<LatencyReport>;

    fn sources_metadata(&self) -> Vec<SourceMetadata>;

    fn status_updates(&self) -> Vec<SourceStatusUpdate>;
}

/// Builds pipelines; the manager owns one factory for the process lifetime
/// and calls it on every (re)start.
pub trait PipelineFactory: Send + Sync {
    fn build(
        &self,
        spec: PipelineSpec,
        on_prediction: PredictionCallback,
    ) -> Result<Arc<dyn DetectionPipeline>, PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_from_config_derives_uris() {
        let mut config = ProcessorConfig::default();
        config.stream_server = "rtsp://proxy:8554".to_string();
        config.stream_source_ids = vec![0, 4];
        config.model_id = "m1".to_string();
        let spec = PipelineSpec::from_config(&config);
        assert_eq!(
            spec.video_references,
            vec!["rtsp://proxy:8554/0", "rtsp://proxy:8554/4"]
        );
        assert_eq!(spec.source_ids, vec![0, 4]);
        assert_eq!(spec.model_id, "m1");
    }
}
