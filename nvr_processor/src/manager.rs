//! Pipeline lifecycle custody.
//!
//! Every mutation of the inference pipeline funnels through here: initial
//! start, two-level pause/resume, bounded terminate, and the coordinated
//! restart used by every reconfiguring command. The join loop in the
//! processor reads the generation counter and restart flag to tell a
//! replacement apart from a real shutdown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{info, warn};

use nvr_common::{LatencyReport, ProcessorStatus, SourceMetadata, SourceStatusUpdate};

use crate::config::SharedConfig;
use crate::control::ControlPublisher;
use crate::error::{CommandError, PipelineError};
use crate::pipeline::{DetectionPipeline, PipelineFactory, PipelineSpec};
use crate::sink::DetectionSink;

const TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PipelineManager {
    factory: Box<dyn PipelineFactory>,
    config: SharedConfig,
    sink: Arc<DetectionSink>,
    control: Arc<ControlPublisher>,
    current: Mutex<Option<Arc<dyn DetectionPipeline>>>,
    /// Bumped on every install; the join loop detects replacement by
    /// comparing against the generation it saved before blocking.
    generation: AtomicU64,
    restarting: AtomicBool,
    paused: AtomicBool,
    installed: Notify,
}

impl PipelineManager {
    pub fn new(
        factory: Box<dyn PipelineFactory>,
        config: SharedConfig,
        sink: Arc<DetectionSink>,
        control: Arc<ControlPublisher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            config,
            sink,
            control,
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
            restarting: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            installed: Notify::new(),
        })
    }

    /// The installed pipeline and its generation, read consistently.
    pub fn current(&self) -> Option<(Arc<dyn DetectionPipeline>, u64)> {
        let guard = self.current.lock();
        guard
            .as_ref()
            .map(|p| (Arc::clone(p), self.generation.load(Ordering::Acquire)))
    }

    /// Readiness is object existence, not a run-state flag: during the long
    /// RTSP connect the pipeline exists but is not yet "running", and
    /// commands must already be accepted.
    pub fn has_pipeline(&self) -> bool {
        self.current.lock().is_some()
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Notified every time a new pipeline is installed; the join loop waits
    /// on this while no pipeline exists (e.g. after a failed restart).
    pub fn installed(&self) -> &Notify {
        &self.installed
    }

    /// Build a pipeline from the live config and start it. Blocks for the
    /// duration of the source connect phase.
    pub async fn start(&self) -> Result<(), PipelineError> {
        let spec = PipelineSpec::from_config(&self.config.read());
        info!(
            sources = ?spec.source_ids,
            model = %spec.model_id,
            max_fps = spec.max_fps,
            "starting pipeline"
        );
        let pipeline = self.factory.build(spec, self.sink.callback())?;
        pipeline.start().await?;
        self.install(pipeline);
        Ok(())
    }

    fn install(&self, pipeline: Arc<dyn DetectionPipeline>) {
        *self.current.lock() = Some(pipeline);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.installed.notify_waiters();
    }

    /// Two-level pause: the sink gate closes first so publishing stops on
    /// the next inference callback, then the pipeline stops buffering new
    /// frames.
    pub fn pause(&self) -> Result<(), CommandError> {
        let pipeline = {
            let guard = self.current.lock();
            guard.as_ref().map(Arc::clone).ok_or(CommandError::NoPipeline)?
        };
        if self.paused.swap(true, Ordering::AcqRel) {
            return Err(CommandError::AlreadyPaused);
        }
        self.sink.pause();
        pipeline.pause_stream();
        Ok(())
    }

    /// Resume in the opposite order: the pipeline refills buffers first,
    /// then the sink starts publishing again.
    pub fn resume(&self) -> Result<(), CommandError> {
        let pipeline = {
            let guard = self.current.lock();
            guard.as_ref().map(Arc::clone).ok_or(CommandError::NoPipeline)?
        };
        if !self.paused.swap(false, Ordering::AcqRel) {
            return Err(CommandError::NotPaused);
        }
        pipeline.resume_stream();
        self.sink.resume();
        Ok(())
    }

    /// Stop and drop the installed pipeline. Idempotent; waits at most
    /// `TERMINATE_TIMEOUT` before forcing cleanup.
    pub async fn terminate(&self) {
        let pipeline = self.current.lock().take();
        let Some(pipeline) = pipeline else { return };
        if tokio::time::timeout(TERMINATE_TIMEOUT, pipeline.terminate())
            .await
            .is_err()
        {
            warn!(
                "pipeline did not terminate within {:?}; forcing cleanup",
                TERMINATE_TIMEOUT
            );
        }
        info!("pipeline terminated");
    }

    /// The single authoritative restart primitive. Rejects overlap, flips
    /// the restart flag before tearing the old pipeline down, reuses the
    /// sink and bus connection, and clears the flag only after the new
    /// handle is installed.
    pub async fn restart_with_coordination(&self) -> Result<(), CommandError> {
        if self
            .restarting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CommandError::RestartInProgress);
        }

        self.control.publish_status(ProcessorStatus::Reconfiguring).await;
        self.terminate().await;

        match self.start().await {
            Ok(()) => {
                // A reconfigured pipeline comes back publishing: reopen the
                // gate before announcing `running`.
                self.paused.store(false, Ordering::Release);
                self.sink.resume();
                self.control.publish_status(ProcessorStatus::Running).await;
                self.restarting.store(false, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                warn!("restart failed: {e}");
                self.control.publish_status(ProcessorStatus::Error).await;
                self.restarting.store(false, Ordering::Release);
                Err(CommandError::RestartFailed(e.to_string()))
            }
        }
    }

    pub fn throughput(&self) -> f64 {
        self.current
            .lock()
            .as_ref()
            .map(|p| p.throughput())
            .unwrap_or(0.0)
    }

    pub fn latency_reports(&self) -> Vec<LatencyReport> {
        self.current
            .lock()
            .as_ref()
            .map(|p| p.latency_reports())
            .unwrap_or_default()
    }

    pub fn sources_metadata(&self) -> Vec<SourceMetadata> {
        self.current
            .lock()
            .as_ref()
            .map(|p| p.sources_metadata())
            .unwrap_or_default()
    }

    pub fn status_updates(&self) -> Vec<SourceStatusUpdate> {
        self.current
            .lock()
            .as_ref()
            .map(|p| p.status_updates())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use nvr_common::StatusMessage;

    use crate::config::ProcessorConfig;
    use crate::pipeline::synthetic::SyntheticFactory;
    use crate::testutil::{FailingFactory, RecordingPublisher};

    fn manager_with(
        factory: Box<dyn PipelineFactory>,
    ) -> (Arc<PipelineManager>, Arc<RecordingPublisher>, SharedConfig) {
        let bus = RecordingPublisher::new();
        let mut config = ProcessorConfig::default();
        config.instance_id = "node-a".to_string();
        config.max_fps = 100.0;
        let shared = config.into_shared();
        let sink = DetectionSink::new(bus.clone(), Arc::clone(&shared));
        let control = ControlPublisher::new(bus.clone(), Arc::clone(&shared));
        let manager = PipelineManager::new(factory, Arc::clone(&shared), sink, control);
        (manager, bus, shared)
    }

    fn synthetic() -> Box<dyn PipelineFactory> {
        Box::new(SyntheticFactory::new(Duration::ZERO))
    }

    fn statuses(bus: &RecordingPublisher) -> Vec<ProcessorStatus> {
        bus.decoded::<StatusMessage>("nvr/control/status/node-a")
            .iter()
            .map(|m| m.status)
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_installs_and_bumps_generation() {
        let (manager, _bus, _config) = manager_with(synthetic());
        assert!(!manager.has_pipeline());
        assert_eq!(manager.generation(), 0);

        manager.start().await.unwrap();
        assert!(manager.has_pipeline());
        assert_eq!(manager.generation(), 1);

        manager.terminate().await;
        assert!(!manager.has_pipeline());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restart_replaces_pipeline() {
        let (manager, bus, _config) = manager_with(synthetic());
        manager.start().await.unwrap();
        let (old, old_gen) = manager.current().unwrap();

        manager.restart_with_coordination().await.unwrap();
        let (new, new_gen) = manager.current().unwrap();

        assert!(!Arc::ptr_eq(&old, &new));
        assert!(new_gen > old_gen);
        assert!(!manager.is_restarting());
        assert_eq!(
            statuses(&bus),
            vec![ProcessorStatus::Reconfiguring, ProcessorStatus::Running]
        );

        // The old pipeline fully exited.
        old.join().await;
        manager.terminate().await;
    }

    #[tokio::test]
    async fn test_overlapping_restart_is_rejected() {
        let (manager, _bus, _config) = manager_with(synthetic());
        manager.start().await.unwrap();

        manager.restarting.store(true, Ordering::Release);
        let err = manager.restart_with_coordination().await.unwrap_err();
        assert!(matches!(err, CommandError::RestartInProgress));
        manager.restarting.store(false, Ordering::Release);
        manager.terminate().await;
    }

    #[tokio::test]
    async fn test_failed_restart_publishes_error_and_clears_flag() {
        let (manager, bus, _config) = manager_with(Box::new(FailingFactory));
        let err = manager.restart_with_coordination().await.unwrap_err();
        assert!(matches!(err, CommandError::RestartFailed(_)));
        assert!(!manager.is_restarting());
        assert!(!manager.has_pipeline());
        assert_eq!(
            statuses(&bus),
            vec![ProcessorStatus::Reconfiguring, ProcessorStatus::Error]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pause_resume_preconditions() {
        let (manager, _bus, _config) = manager_with(synthetic());
        assert!(matches!(manager.pause(), Err(CommandError::NoPipeline)));
        assert!(matches!(manager.resume(), Err(CommandError::NoPipeline)));

        manager.start().await.unwrap();
        manager.pause().unwrap();
        assert!(manager.is_paused());
        assert!(matches!(manager.pause(), Err(CommandError::AlreadyPaused)));

        manager.resume().unwrap();
        assert!(!manager.is_paused());
        assert!(matches!(manager.resume(), Err(CommandError::NotPaused)));
        manager.terminate().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restart_reopens_sink_gate() {
        let (manager, _bus, _config) = manager_with(synthetic());
        manager.start().await.unwrap();
        manager.pause().unwrap();
        assert!(manager.sink.is_gated());

        manager.restart_with_coordination().await.unwrap();
        assert!(!manager.is_paused());
        assert!(!manager.sink.is_gated());
        manager.terminate().await;
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let (manager, _bus, _config) = manager_with(synthetic());
        manager.terminate().await;
        manager.start().await.unwrap();
        manager.terminate().await;
        manager.terminate().await;
    }
}
