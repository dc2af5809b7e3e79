//! Detection sink: the data-plane bridge from the inference callback to
//! the bus.
//!
//! Runs on whatever thread the engine calls from, so it never blocks and
//! never lets an error escape back into the engine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use rumqttc::QoS;
use tracing::{debug, info, warn};

use nvr_common::{topics, DetectionEvent};

use crate::bus::BusPublisher;
use crate::config::SharedConfig;
use crate::pipeline::{FramePrediction, PredictionCallback};

pub struct DetectionSink {
    bus: Arc<dyn BusPublisher>,
    config: SharedConfig,
    /// Publish gate. Release/acquire pairs make a `pause()` on the dispatch
    /// task visible to the very next inference callback on another thread.
    gate_open: AtomicBool,
    published: AtomicU64,
    suppressed: AtomicU64,
    publish_errors: AtomicU64,
}

impl DetectionSink {
    pub fn new(bus: Arc<dyn BusPublisher>, config: SharedConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            gate_open: AtomicBool::new(true),
            published: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            publish_errors: AtomicU64::new(0),
        })
    }

    /// Close the gate. Takes effect on the next callback invocation,
    /// independent of the pipeline's own (slower) buffering pause.
    pub fn pause(&self) {
        self.gate_open.store(false, Ordering::Release);
    }

    pub fn resume(&self) {
        self.gate_open.store(true, Ordering::Release);
    }

    pub fn is_gated(&self) -> bool {
        !self.gate_open.load(Ordering::Acquire)
    }

    /// Engine callback. One `DetectionEvent` per frame, published
    /// fire-and-forget; model id and topic prefix are read through the
    /// live config on every call, never captured, so `change_model` takes
    /// effect on the first event after the restart.
    pub fn on_prediction(&self, batch: &[FramePrediction]) {
        if !self.gate_open.load(Ordering::Acquire) {
            self.suppressed.fetch_add(batch.len() as u64, Ordering::Relaxed);
            return;
        }

        let (model_id, prefix) = {
            let config = self.config.read();
            (config.model_id.clone(), config.detection_topic_prefix.clone())
        };

        for prediction in batch {
            let event = DetectionEvent {
                source_id: prediction.frame.source_id,
                frame_id: prediction.frame.frame_id,
                timestamp: prediction.frame.timestamp,
                model_id: model_id.clone(),
                inference_time_ms: prediction.inference_time_ms,
                detections: prediction.detections.clone(),
                fps: prediction.fps,
                latency_ms: prediction.latency_ms,
            };
            let topic = topics::detection_topic(&prefix, event.source_id);
            let payload = match serde_json::to_vec(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    self.publish_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(source_id = event.source_id, "failed to encode detection event: {e}");
                    continue;
                }
            };
            if let Err(e) = self.bus.try_publish(&topic, QoS::AtMostOnce, false, payload) {
                self.publish_errors.fetch_add(1, Ordering::Relaxed);
                debug!(%topic, "detection publish dropped: {e}");
            } else {
                self.published.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// The callback handed to every pipeline. The sink outlives pipeline
    /// restarts, keeping the bus connection warm.
    pub fn callback(self: &Arc<Self>) -> PredictionCallback {
        let sink = Arc::clone(self);
        Arc::new(move |batch: &[FramePrediction]| sink.on_prediction(batch))
    }

    pub fn log_totals(&self) {
        info!(
            published = self.published.load(Ordering::Relaxed),
            suppressed = self.suppressed.load(Ordering::Relaxed),
            errors = self.publish_errors.load(Ordering::Relaxed),
            "detection sink totals"
        );
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}
