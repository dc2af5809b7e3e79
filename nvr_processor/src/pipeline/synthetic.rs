//! Built-in engine backend producing synthetic frames and detections.
//!
//! Stands in for an external inference engine when none is wired: one
//! generator task per source emits person detections at the configured
//! rate. Useful for bring-up, soak testing the control plane, and the
//! test suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use nvr_common::{BoundingBox, Detection, LatencyReport, SourceMetadata, SourceStatusUpdate};

use super::{DetectionPipeline, FrameMeta, FramePrediction, PipelineFactory, PipelineSpec,
            PredictionCallback};
use crate::error::PipelineError;

/// Emission rate when max_fps is 0 (unbounded).
const UNBOUNDED_FPS: f64 = 30.0;
const FRAME_WIDTH: u32 = 1280;
const FRAME_HEIGHT: u32 = 720;

pub struct SyntheticFactory {
    connect_delay: Duration,
}

impl SyntheticFactory {
    pub fn new(connect_delay: Duration) -> Self {
        Self { connect_delay }
    }
}

impl PipelineFactory for SyntheticFactory {
    fn build(
        &self,
        spec: PipelineSpec,
        on_prediction: PredictionCallback,
    ) -> Result<Arc<dyn DetectionPipeline>, PipelineError> {
        if spec.source_ids.is_empty() {
            return Err(PipelineError::Build("no sources in spec".to_string()));
        }
        Ok(Arc::new(SyntheticPipeline::new(
            spec,
            on_prediction,
            self.connect_delay,
        )))
    }
}

struct Shared {
    paused: AtomicBool,
    inference_count: AtomicU64,
    started_at: Mutex<Option<Instant>>,
    last_latency: Mutex<HashMap<u32, LatencyReport>>,
}

pub struct SyntheticPipeline {
    spec: PipelineSpec,
    callback: PredictionCallback,
    connect_delay: Duration,
    shared: Arc<Shared>,
    stop_tx: watch::Sender<bool>,
    exited_tx: watch::Sender<bool>,
    exited_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyntheticPipeline {
    fn new(spec: PipelineSpec, callback: PredictionCallback, connect_delay: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (exited_tx, exited_rx) = watch::channel(false);
        Self {
            spec,
            callback,
            connect_delay,
            shared: Arc::new(Shared {
                paused: AtomicBool::new(false),
                inference_count: AtomicU64::new(0),
                started_at: Mutex::new(None),
                last_latency: Mutex::new(HashMap::new()),
            }),
            stop_tx,
            exited_tx,
            exited_rx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn effective_fps(&self) -> f64 {
        if self.spec.max_fps > 0.0 {
            self.spec.max_fps
        } else {
            UNBOUNDED_FPS
        }
    }
}

#[async_trait]
impl DetectionPipeline for SyntheticPipeline {
    async fn start(&self) -> Result<(), PipelineError> {
        if self.spec.model_id.trim().is_empty() {
            return Err(PipelineError::Start("model id is empty".to_string()));
        }
        if self.connect_delay > Duration::ZERO {
            debug!(delay = ?self.connect_delay, "simulating source connect");
            tokio::time::sleep(self.connect_delay).await;
        }

        let fps = self.effective_fps();
        let period = Duration::from_secs_f64(1.0 / fps);
        *self.shared.started_at.lock() = Some(Instant::now());

        let mut handles = Vec::with_capacity(self.spec.source_ids.len());
        for &source_id in &self.spec.source_ids {
            handles.push(tokio::spawn(generate_source(
                source_id,
                period,
                fps,
                Arc::clone(&self.shared),
                Arc::clone(&self.callback),
                self.stop_tx.subscribe(),
            )));
        }

        // Supervisor marks the pipeline exited once every generator is done.
        let exited_tx = self.exited_tx.clone();
        let supervisor = tokio::spawn(async move {
            for handle in handles {
                let _ = handle.await;
            }
            let _ = exited_tx.send(true);
        });
        self.tasks.lock().push(supervisor);

        info!(
            sources = self.spec.source_ids.len(),
            model = %self.spec.model_id,
            fps,
            "synthetic pipeline started"
        );
        Ok(())
    }

    fn pause_stream(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    fn resume_stream(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    async fn terminate(&self) {
        let _ = self.stop_tx.send(true);
        if self.shared.started_at.lock().is_none() {
            // Never started; nothing will flip the exit flag.
            let _ = self.exited_tx.send(true);
        }
        self.join().await;
    }

    async fn join(&self) {
        let mut rx = self.exited_rx.clone();
        let _ = rx.wait_for(|exited| *exited).await;
    }

    fn throughput(&self) -> f64 {
        let elapsed = match *self.shared.started_at.lock() {
            Some(at) => at.elapsed().as_secs_f64(),
            None => return 0.0,
        };
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.shared.inference_count.load(Ordering::Relaxed) as f64 / elapsed
    }

    fn latency_reports(&self) -> Vec<LatencyReport> {
        let mut reports: Vec<LatencyReport> =
            self.shared.last_latency.lock().values().cloned().collect();
        reports.sort_by_key(|r| r.source_id);
        reports
    }

    fn sources_metadata(&self) -> Vec<SourceMetadata> {
        self.spec
            .source_ids
            .iter()
            .map(|&source_id| SourceMetadata {
                source_id,
                fps: self.effective_fps(),
                width: FRAME_WIDTH,
                height: FRAME_HEIGHT,
            })
            .collect()
    }

    fn status_updates(&self) -> Vec<SourceStatusUpdate> {
        Vec::new()
    }
}

async fn generate_source(
    source_id: u32,
    period: Duration,
    fps: f64,
    shared: Arc<Shared>,
    callback: PredictionCallback,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut frame_id = 0u64;

    loop {
        tokio::select! {
            changed = stop_rx.wait_for(|stopped| *stopped) => {
                let _ = changed;
                break;
            }
            _ = ticker.tick() => {
                if shared.paused.load(Ordering::Acquire) {
                    continue;
                }
                frame_id += 1;
                let prediction = synth_prediction(source_id, frame_id, fps);
                shared.inference_count.fetch_add(1, Ordering::Relaxed);
                shared.last_latency.lock().insert(source_id, LatencyReport {
                    source_id,
                    frame_decoding_latency_ms: prediction.latency_ms.unwrap_or(0.0) * 0.2,
                    inference_latency_ms: prediction.inference_time_ms,
                    e2e_latency_ms: prediction.latency_ms.unwrap_or(0.0),
                });
                (callback)(std::slice::from_ref(&prediction));
            }
        }
    }
    debug!(source_id, frames = frame_id, "source generator stopped");
}

fn synth_prediction(source_id: u32, frame_id: u64, fps: f64) -> FramePrediction {
    let mut rng = rand::thread_rng();
    let inference_time_ms = rng.gen_range(12.0..28.0);
    let count = rng.gen_range(0..3);
    let detections = (0..count)
        .map(|_| {
            let width = rng.gen_range(40.0..160.0);
            let height = rng.gen_range(90.0..320.0);
            Detection {
                class_name: "person".to_string(),
                confidence: rng.gen_range(0.5..1.0),
                bbox: BoundingBox {
                    x: rng.gen_range(0.0..(FRAME_WIDTH as f32 - width)),
                    y: rng.gen_range(0.0..(FRAME_HEIGHT as f32 - height)),
                    width,
                    height,
                },
                tracker_id: None,
            }
        })
        .collect();

    FramePrediction {
        frame: FrameMeta {
            source_id,
            frame_id,
            timestamp: Utc::now(),
        },
        detections,
        inference_time_ms,
        fps: Some(fps),
        latency_ms: Some(inference_time_ms + 8.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn spec(source_ids: Vec<u32>, max_fps: f64) -> PipelineSpec {
        PipelineSpec {
            video_references: source_ids
                .iter()
                .map(|id| format!("rtsp://localhost:8554/{id}"))
                .collect(),
            source_ids,
            model_id: "m1".to_string(),
            max_fps,
        }
    }

    fn counting_callback() -> (PredictionCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let cb: PredictionCallback = Arc::new(move |batch: &[FramePrediction]| {
            counter.fetch_add(batch.len(), Ordering::SeqCst);
        });
        (cb, count)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_emits_frames_then_terminates() {
        let (cb, count) = counting_callback();
        let factory = SyntheticFactory::new(Duration::ZERO);
        let pipeline = factory.build(spec(vec![0, 1], 100.0), cb).unwrap();
        pipeline.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(count.load(Ordering::SeqCst) > 0);
        assert!(pipeline.throughput() > 0.0);
        assert_eq!(pipeline.sources_metadata().len(), 2);

        pipeline.terminate().await;
        pipeline.join().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pause_stops_new_frames() {
        let (cb, count) = counting_callback();
        let factory = SyntheticFactory::new(Duration::ZERO);
        let pipeline = factory.build(spec(vec![0], 100.0), cb).unwrap();
        pipeline.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        pipeline.pause_stream();
        // One in-flight tick may still land after the flag flips.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_pause = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(count.load(Ordering::SeqCst) <= after_pause + 1);

        pipeline.resume_stream();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(count.load(Ordering::SeqCst) > after_pause + 1);

        pipeline.terminate().await;
    }

    #[tokio::test]
    async fn test_start_rejects_empty_model() {
        let (cb, _count) = counting_callback();
        let factory = SyntheticFactory::new(Duration::ZERO);
        let pipeline = factory.build(spec(vec![0], 10.0), cb).unwrap();
        let mut bad = spec(vec![0], 10.0);
        bad.model_id = "  ".to_string();
        let (cb2, _c2) = counting_callback();
        let failing = factory.build(bad, cb2).unwrap();
        assert!(failing.start().await.is_err());
        // The good pipeline still starts after the failed sibling.
        pipeline.start().await.unwrap();
        pipeline.terminate().await;
    }

    #[tokio::test]
    async fn test_terminate_before_start_is_clean() {
        let (cb, _count) = counting_callback();
        let factory = SyntheticFactory::new(Duration::ZERO);
        let pipeline = factory.build(spec(vec![0], 10.0), cb).unwrap();
        pipeline.terminate().await;
        pipeline.join().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_latency_reports_cover_active_sources() {
        let (cb, _count) = counting_callback();
        let factory = SyntheticFactory::new(Duration::ZERO);
        let pipeline = factory.build(spec(vec![3, 5], 100.0), cb).unwrap();
        pipeline.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let reports = pipeline.latency_reports();
        let ids: Vec<u32> = reports.iter().map(|r| r.source_id).collect();
        assert_eq!(ids, vec![3, 5]);
        for report in &reports {
            assert!(report.e2e_latency_ms >= report.inference_latency_ms);
        }
        pipeline.terminate().await;
    }
}
