//! Composition root.
//!
//! The initialization order is contractual: the control plane is connected
//! and the initial retained status published before the first pipeline
//! start, which can block for tens of seconds while sources connect.
//! Commands arriving in that window are dispatched normally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Notify;
use tracing::{info, warn};

use nvr_common::ProcessorStatus;

use crate::bus::{BusConnection, BusPublisher};
use crate::config::{ProcessorConfig, SharedConfig};
use crate::control::{ControlPlane, ControlPublisher};
use crate::handlers::{self, CommandContext};
use crate::manager::PipelineManager;
use crate::pipeline::PipelineFactory;
use crate::reporter::MetricsReporter;
use crate::sink::DetectionSink;

/// Poll period while draining a restart, and while waiting for a pipeline
/// to reappear after a failed one.
const RESTART_POLL: Duration = Duration::from_millis(50);
const IDLE_POLL: Duration = Duration::from_millis(200);

/// Process-exit request shared by the `stop` handler and the signal task.
pub struct ShutdownHandle {
    requested: AtomicBool,
    notify: Notify,
}

impl ShutdownHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requested: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            if self.is_requested() {
                return;
            }
            let notified = self.notify.notified();
            // Re-check after registering so a request between the two
            // cannot be missed.
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

pub struct Processor {
    config: SharedConfig,
    shutdown: Arc<ShutdownHandle>,
}

impl Processor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            config: config.into_shared(),
            shutdown: ShutdownHandle::new(),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<ShutdownHandle> {
        Arc::clone(&self.shutdown)
    }

    pub async fn run(self, factory: Box<dyn PipelineFactory>) -> anyhow::Result<()> {
        let boot_config = self.config.read().clone();
        info!(instance_id = %boot_config.instance_id, "starting processor");

        // Wire the control plane before anything that can block.
        let (bus_handle, bus_events) = BusConnection::connect(&boot_config)
            .await
            .context("bus unavailable")?;
        let bus: Arc<dyn BusPublisher> = Arc::new(bus_handle.clone());

        let sink = DetectionSink::new(Arc::clone(&bus), Arc::clone(&self.config));
        let control = ControlPublisher::new(Arc::clone(&bus), Arc::clone(&self.config));
        let manager = PipelineManager::new(
            factory,
            Arc::clone(&self.config),
            Arc::clone(&sink),
            Arc::clone(&control),
        );
        let reporter = MetricsReporter::new(
            Arc::clone(&bus),
            Arc::clone(&self.config),
            Arc::clone(&manager),
        );

        let mut plane = ControlPlane::new(Arc::clone(&control), Arc::clone(&self.config));
        let ctx = Arc::new(CommandContext {
            config: Arc::clone(&self.config),
            manager: Arc::clone(&manager),
            sink: Arc::clone(&sink),
            control: Arc::clone(&control),
            reporter: Arc::clone(&reporter),
            shutdown: Arc::clone(&self.shutdown),
        });
        handlers::register_all(&mut plane, &ctx);
        info!(commands = ?plane.registered_commands(), "command registry ready");

        control.publish_status(ProcessorStatus::Connected).await;
        let dispatch = tokio::spawn(plane.run(bus_events));

        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received");
            shutdown.request();
        });

        // Commands are already being accepted; this may block for a long
        // time while RTSP sources come up.
        manager
            .start()
            .await
            .context("initial pipeline start failed")?;
        control.publish_status(ProcessorStatus::Running).await;

        reporter.spawn();

        join_loop(Arc::clone(&manager), Arc::clone(&self.shutdown)).await;

        info!("shutting down");
        reporter.stop().await;
        sink.pause();
        manager.terminate().await;
        sink.log_totals();
        if control.last_status().status != ProcessorStatus::Stopped {
            control.publish_status(ProcessorStatus::Stopped).await;
        }
        if let Err(e) = bus_handle.disconnect().await {
            warn!("bus disconnect failed: {e}");
        }
        let _ = tokio::time::timeout(Duration::from_secs(2), dispatch).await;
        info!("processor stopped");
        Ok(())
    }
}

/// The main wait loop. Blocks on the installed pipeline's `join` and uses
/// dual-condition detection to tell a restart (flag set, or the installed
/// handle's generation moved past the one saved here) from a real
/// shutdown. Either condition alone is racy: the flag can clear before this
/// task wakes, and the generation alone misses a restart that fails before
/// installing.
pub(crate) async fn join_loop(manager: Arc<PipelineManager>, shutdown: Arc<ShutdownHandle>) {
    loop {
        let (pipeline, generation) = match manager.current() {
            Some(current) => current,
            None => {
                // No pipeline installed (e.g. a restart failed). Stay alive
                // and command-responsive until one appears or exit is
                // requested.
                if shutdown.is_requested() {
                    break;
                }
                tokio::select! {
                    _ = manager.installed().notified() => {}
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
                continue;
            }
        };

        tokio::select! {
            _ = pipeline.join() => {}
            _ = shutdown.wait() => break,
        }

        if manager.is_restarting() || manager.generation() != generation {
            while manager.is_restarting() {
                tokio::time::sleep(RESTART_POLL).await;
            }
            continue;
        }
        break;
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
