//! In-process doubles for the bus and pipeline seams, shared by the unit
//! and integration test suites.
//!
//! Gated behind `#[cfg(any(test, feature = "test-support"))]`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::QoS;

use crate::bus::BusPublisher;
use crate::error::{BusError, PipelineError};
use crate::pipeline::{DetectionPipeline, PipelineFactory, PipelineSpec, PredictionCallback};

#[derive(Debug, Clone)]
pub struct Recorded {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Vec<u8>,
}

/// Records every publish instead of talking to a broker.
#[derive(Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<Recorded>>,
    fail: Mutex<bool>,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_publishes(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn messages(&self) -> Vec<Recorded> {
        self.messages.lock().clone()
    }

    pub fn on_topic(&self, topic: &str) -> Vec<Recorded> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn decoded<T: serde::de::DeserializeOwned>(&self, topic: &str) -> Vec<T> {
        self.on_topic(topic)
            .iter()
            .map(|m| serde_json::from_slice(&m.payload).unwrap())
            .collect()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }

    fn record(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        if *self.fail.lock() {
            return Err(BusError::PublishFailed {
                topic: topic.to_string(),
                reason: "publisher set to fail".to_string(),
            });
        }
        self.messages.lock().push(Recorded {
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        });
        Ok(())
    }
}

/// Factory whose pipelines refuse to start, for exercising restart
/// failure and rollback paths.
pub struct FailingFactory;

impl PipelineFactory for FailingFactory {
    fn build(
        &self,
        spec: PipelineSpec,
        _on_prediction: PredictionCallback,
    ) -> Result<Arc<dyn DetectionPipeline>, PipelineError> {
        Ok(Arc::new(UnstartablePipeline { spec }))
    }
}

struct UnstartablePipeline {
    spec: PipelineSpec,
}

#[async_trait]
impl DetectionPipeline for UnstartablePipeline {
    async fn start(&self) -> Result<(), PipelineError> {
        Err(PipelineError::Start(format!(
            "model `{}` could not be loaded",
            self.spec.model_id
        )))
    }

    fn pause_stream(&self) {}

    fn resume_stream(&self) {}

    async fn terminate(&self) {}

    async fn join(&self) {}

    fn throughput(&self) -> f64 {
        0.0
    }

    fn latency_reports(&self) -> Vec<nvr_common::LatencyReport> {
        Vec::new()
    }

    fn sources_metadata(&self) -> Vec<nvr_common::SourceMetadata> {
        Vec::new()
    }

    fn status_updates(&self) -> Vec<nvr_common::SourceStatusUpdate> {
        Vec::new()
    }
}

#[async_trait]
impl BusPublisher for RecordingPublisher {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        self.record(topic, qos, retain, payload)
    }

    fn try_publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        self.record(topic, qos, retain, payload)
    }
}
