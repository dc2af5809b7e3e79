//! End-to-end control-plane flows: raw command payloads in, acks, status
//! transitions and detection events out, with the synthetic engine behind
//! the pipeline seam and a recording publisher in place of the broker.

use std::sync::Arc;
use std::time::Duration;

use nvr_common::{AckStatus, CommandAck, DetectionEvent, ProcessorStatus, StatusMessage};
use nvr_processor::config::ProcessorConfig;
use nvr_processor::control::{ControlPlane, ControlPublisher};
use nvr_processor::error::PipelineError;
use nvr_processor::handlers::{self, CommandContext};
use nvr_processor::manager::PipelineManager;
use nvr_processor::pipeline::synthetic::SyntheticFactory;
use nvr_processor::pipeline::{DetectionPipeline, PipelineFactory, PipelineSpec, PredictionCallback};
use nvr_processor::processor::ShutdownHandle;
use nvr_processor::reporter::MetricsReporter;
use nvr_processor::sink::DetectionSink;
use nvr_processor::testutil::{FailingFactory, RecordingPublisher};

/// Delegates to the synthetic engine except for one model id whose
/// pipelines refuse to start.
struct ModelGatedFactory {
    inner: SyntheticFactory,
    broken_model: &'static str,
}

impl PipelineFactory for ModelGatedFactory {
    fn build(
        &self,
        spec: PipelineSpec,
        on_prediction: PredictionCallback,
    ) -> Result<Arc<dyn DetectionPipeline>, PipelineError> {
        if spec.model_id == self.broken_model {
            FailingFactory.build(spec, on_prediction)
        } else {
            self.inner.build(spec, on_prediction)
        }
    }
}

struct Harness {
    plane: Arc<ControlPlane>,
    ctx: Arc<CommandContext>,
    bus: Arc<RecordingPublisher>,
}

impl Harness {
    fn new(instance_id: &str, factory: Box<dyn PipelineFactory>) -> Self {
        let bus = RecordingPublisher::new();
        let mut config = ProcessorConfig::default();
        config.instance_id = instance_id.to_string();
        config.stream_source_ids = vec![0, 1];
        config.model_id = "m1".to_string();
        config.max_fps = 100.0;
        let shared = config.into_shared();

        let sink = DetectionSink::new(bus.clone(), Arc::clone(&shared));
        let control = ControlPublisher::new(bus.clone(), Arc::clone(&shared));
        let manager = PipelineManager::new(
            factory,
            Arc::clone(&shared),
            Arc::clone(&sink),
            Arc::clone(&control),
        );
        let reporter = MetricsReporter::new(bus.clone(), Arc::clone(&shared), Arc::clone(&manager));
        let ctx = Arc::new(CommandContext {
            config: shared,
            manager,
            sink,
            control: Arc::clone(&control),
            reporter,
            shutdown: ShutdownHandle::new(),
        });

        let mut plane = ControlPlane::new(control, Arc::clone(&ctx.config));
        handlers::register_all(&mut plane, &ctx);
        Self {
            plane: Arc::new(plane),
            ctx,
            bus,
        }
    }

    fn synthetic(instance_id: &str) -> Self {
        Self::new(instance_id, Box::new(SyntheticFactory::new(Duration::ZERO)))
    }

    async fn send(&self, payload: &str) {
        self.plane.dispatch(payload.as_bytes()).await;
    }

    fn acks(&self, instance_id: &str) -> Vec<CommandAck> {
        self.bus
            .decoded(&format!("nvr/control/status/{instance_id}/ack"))
    }

    fn statuses(&self, instance_id: &str) -> Vec<ProcessorStatus> {
        self.bus
            .decoded::<StatusMessage>(&format!("nvr/control/status/{instance_id}"))
            .iter()
            .map(|m| m.status)
            .collect()
    }

    fn detections(&self, source_id: u32) -> Vec<DetectionEvent> {
        self.bus.decoded(&format!("nvr/detections/{source_id}"))
    }

    fn detection_count(&self) -> usize {
        self.bus
            .messages()
            .iter()
            .filter(|m| m.topic.starts_with("nvr/detections/"))
            .count()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_stops_publications_promptly() {
    let h = Harness::synthetic("node-a");
    h.ctx.manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(h.detection_count() > 0, "pipeline should be publishing");

    h.send(r#"{"command":"pause"}"#).await;
    // One inference period at 100 fps is 10 ms; allow a generous bound for
    // an in-flight callback, then require quiescence.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let after_pause = h.detection_count();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(h.detection_count(), after_pause, "no publishes while paused");

    let acks = h.acks("node-a");
    assert_eq!(acks.len(), 2);
    assert_eq!(acks[1].ack_status, AckStatus::Completed);
    assert_eq!(h.statuses("node-a"), vec![ProcessorStatus::Paused]);

    h.send(r#"{"command":"resume"}"#).await;
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(h.detection_count() > after_pause, "publishing resumes");
    assert_eq!(
        h.statuses("node-a"),
        vec![ProcessorStatus::Paused, ProcessorStatus::Running]
    );

    h.ctx.manager.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn second_pause_errors_without_second_transition() {
    let h = Harness::synthetic("node-a");
    h.ctx.manager.start().await.unwrap();

    h.send(r#"{"command":"pause"}"#).await;
    h.send(r#"{"command":"pause"}"#).await;

    let acks = h.acks("node-a");
    assert_eq!(acks.len(), 4);
    assert_eq!(acks[1].ack_status, AckStatus::Completed);
    assert_eq!(acks[3].ack_status, AckStatus::Error);
    assert_eq!(acks[3].error_kind.as_deref(), Some("AlreadyPaused"));
    // Exactly one state transition.
    assert_eq!(h.statuses("node-a"), vec![ProcessorStatus::Paused]);

    h.ctx.manager.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn change_model_updates_published_identifier() {
    let h = Harness::synthetic("node-a");
    h.ctx.manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(h.detections(0).iter().all(|e| e.model_id == "m1"));

    h.send(r#"{"command":"change_model","params":{"model_id":"m2"}}"#).await;
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(
        h.statuses("node-a"),
        vec![ProcessorStatus::Reconfiguring, ProcessorStatus::Running]
    );
    let events = h.detections(0);
    let first_m2 = events.iter().position(|e| e.model_id == "m2");
    let first_m2 = first_m2.expect("new model must publish after the restart");
    assert!(
        events[first_m2..].iter().all(|e| e.model_id == "m2"),
        "no stale model id after the cutover"
    );

    h.ctx.manager.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn add_then_remove_stream_round_trip() {
    let h = Harness::synthetic("node-a");
    h.ctx.manager.start().await.unwrap();
    let before = h.ctx.config.read().stream_source_ids.clone();

    h.send(r#"{"command":"add_stream","params":{"source_id":2}}"#).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        !h.detections(2).is_empty(),
        "new source must publish after the restart"
    );

    h.send(r#"{"command":"remove_stream","params":{"source_id":2}}"#).await;
    let settled = h.detections(2).len();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(h.detections(2).len(), settled, "removed source is silent");
    assert_eq!(h.ctx.config.read().stream_source_ids, before);
    // Surviving sources keep publishing after the restart gap.
    let count_0 = h.detections(0).len();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(h.detections(0).len() > count_0);

    h.ctx.manager.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn overlapping_reconfigure_is_rejected() {
    // 200 ms simulated connect keeps the first restart in flight while the
    // second command arrives.
    let h = Harness::new(
        "node-a",
        Box::new(SyntheticFactory::new(Duration::from_millis(200))),
    );
    h.ctx.manager.start().await.unwrap();

    let plane = Arc::clone(&h.plane);
    let first = tokio::spawn(async move {
        plane
            .dispatch(br#"{"command":"change_model","params":{"model_id":"m2"}}"#)
            .await;
    });
    tokio::time::sleep(Duration::from_millis(80)).await;
    h.send(r#"{"command":"change_model","params":{"model_id":"m3"}}"#).await;
    first.await.unwrap();

    let acks = h.acks("node-a");
    let terminal: Vec<&CommandAck> = acks
        .iter()
        .filter(|a| a.ack_status != AckStatus::Received)
        .collect();
    assert_eq!(terminal.len(), 2);
    let errors: Vec<&&CommandAck> = terminal
        .iter()
        .filter(|a| a.ack_status == AckStatus::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error_kind.as_deref(), Some("RestartInProgress"));
    // Only the first change landed.
    assert_eq!(h.ctx.config.read().model_id, "m2");

    h.ctx.manager.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn targeted_command_only_reaches_named_instance() {
    let a = Harness::synthetic("node-a");
    let b = Harness::synthetic("node-b");
    a.ctx.manager.start().await.unwrap();
    b.ctx.manager.start().await.unwrap();

    let payload = r#"{"command":"pause","target_instances":["node-b"]}"#;
    a.send(payload).await;
    b.send(payload).await;

    assert!(a.acks("node-a").is_empty(), "node-a must stay silent");
    assert!(a.statuses("node-a").is_empty());
    assert!(!a.ctx.manager.is_paused());

    let b_acks = b.acks("node-b");
    assert_eq!(b_acks.len(), 2);
    assert_eq!(b_acks[1].ack_status, AckStatus::Completed);
    assert_eq!(b.statuses("node-b"), vec![ProcessorStatus::Paused]);

    a.ctx.manager.terminate().await;
    b.ctx.manager.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rollback_on_model_that_fails_to_start() {
    let h = Harness::new(
        "node-a",
        Box::new(ModelGatedFactory {
            inner: SyntheticFactory::new(Duration::ZERO),
            broken_model: "broken",
        }),
    );
    h.ctx.manager.start().await.unwrap();

    h.send(r#"{"command":"change_model","params":{"model_id":"broken"}}"#).await;

    assert_eq!(
        h.statuses("node-a"),
        vec![ProcessorStatus::Reconfiguring, ProcessorStatus::Error]
    );
    let acks = h.acks("node-a");
    assert_eq!(acks[1].ack_status, AckStatus::Error);
    assert_eq!(acks[1].error_kind.as_deref(), Some("RestartFailed"));
    assert_eq!(h.ctx.config.read().model_id, "m1");

    // A status query re-asserts the error state.
    h.send(r#"{"command":"status"}"#).await;
    let statuses = h.statuses("node-a");
    assert_eq!(statuses.last(), Some(&ProcessorStatus::Error));

    // A valid change recovers to running.
    h.send(r#"{"command":"change_model","params":{"model_id":"m4"}}"#).await;
    assert_eq!(h.ctx.config.read().model_id, "m4");
    assert_eq!(
        h.statuses("node-a").last(),
        Some(&ProcessorStatus::Running)
    );

    h.ctx.manager.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn commands_are_accepted_before_the_pipeline_exists() {
    // Pipeline never started: the connect-phase window.
    let h = Harness::synthetic("node-a");

    h.send(r#"{"command":"ping"}"#).await;
    h.send(r#"{"command":"pause"}"#).await;

    let acks = h.acks("node-a");
    assert_eq!(acks.len(), 4);
    assert_eq!(acks[1].ack_status, AckStatus::Completed, "ping works early");
    assert_eq!(acks[3].ack_status, AckStatus::Error);
    assert_eq!(acks[3].error_kind.as_deref(), Some("NoPipeline"));
}

#[tokio::test(flavor = "multi_thread")]
async fn change_model_round_trip_is_idempotent() {
    let h = Harness::synthetic("node-a");
    h.ctx.manager.start().await.unwrap();

    h.send(r#"{"command":"change_model","params":{"model_id":"m2"}}"#).await;
    h.send(r#"{"command":"change_model","params":{"model_id":"m3"}}"#).await;
    h.send(r#"{"command":"change_model","params":{"model_id":"m2"}}"#).await;

    assert_eq!(h.ctx.config.read().model_id, "m2");
    assert_eq!(h.ctx.config.read().stream_source_ids, vec![0, 1]);
    assert_eq!(h.statuses("node-a").last(), Some(&ProcessorStatus::Running));

    h.ctx.manager.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_command_quiesces_and_requests_exit() {
    let h = Harness::synthetic("node-a");
    h.ctx.manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.send(r#"{"command":"stop"}"#).await;

    assert!(h.ctx.shutdown.is_requested());
    assert!(!h.ctx.manager.has_pipeline());
    assert_eq!(h.statuses("node-a").last(), Some(&ProcessorStatus::Stopped));
    let settled = h.detection_count();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(h.detection_count(), settled, "nothing publishes after stop");
}
