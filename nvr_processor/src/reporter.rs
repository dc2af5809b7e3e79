//! Metrics reporter: two channels, two verbosity levels.
//!
//! The periodic ticker publishes a lightweight retained snapshot for
//! monitoring dashboards; the `metrics` command requests the full report on
//! the per-instance subtopic. The reporter only reports; it never decides
//! that something is wrong.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rumqttc::QoS;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use nvr_common::{topics, FullMetricsReport, MetricsSnapshot, SourceLatency};

use crate::bus::BusPublisher;
use crate::config::SharedConfig;
use crate::manager::PipelineManager;

pub struct MetricsReporter {
    bus: Arc<dyn BusPublisher>,
    config: SharedConfig,
    manager: Arc<PipelineManager>,
    worker: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl MetricsReporter {
    pub fn new(
        bus: Arc<dyn BusPublisher>,
        config: SharedConfig,
        manager: Arc<PipelineManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            manager,
            worker: Mutex::new(None),
        })
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let sources: Vec<SourceLatency> = self
            .manager
            .latency_reports()
            .iter()
            .map(|r| SourceLatency {
                source_id: r.source_id,
                latency_ms: r.e2e_latency_ms,
            })
            .collect();
        MetricsSnapshot::from_sources(Utc::now(), self.manager.throughput(), sources)
    }

    pub fn full_report(&self) -> FullMetricsReport {
        FullMetricsReport {
            timestamp: Utc::now(),
            inference_throughput: self.manager.throughput(),
            latency_reports: self.manager.latency_reports(),
            sources_metadata: self.manager.sources_metadata(),
            status_updates: self.manager.status_updates(),
        }
    }

    /// Lightweight record, retained on the shared metrics topic.
    pub async fn publish_snapshot(&self) {
        let topic = self.config.read().metrics_topic.clone();
        self.publish_json(&topic, true, &self.snapshot()).await;
    }

    /// Full record, non-retained on the per-instance subtopic. Invoked by
    /// the `metrics` command.
    pub async fn publish_full_report(&self) {
        let topic = {
            let config = self.config.read();
            topics::instance_metrics_topic(&config.control_status_topic, &config.instance_id)
        };
        self.publish_json(&topic, false, &self.full_report()).await;
    }

    /// Start the periodic channel. A zero interval disables it entirely.
    pub fn spawn(self: &Arc<Self>) {
        let interval_secs = self.config.read().metrics_interval_seconds;
        if interval_secs == 0 {
            info!("periodic metrics disabled (interval = 0)");
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let reporter = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => reporter.publish_snapshot().await,
                }
            }
        });
        *self.worker.lock() = Some((stop_tx, handle));
        info!(interval_secs, "metrics reporter started");
    }

    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some((stop_tx, handle)) = worker {
            let _ = stop_tx.send(true);
            let _ = handle.await;
        }
    }

    async fn publish_json<T: serde::Serialize>(&self, topic: &str, retain: bool, value: &T) {
        let payload = match serde_json::to_vec(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%topic, "failed to encode metrics: {e}");
                return;
            }
        };
        if let Err(e) = self.bus.publish(topic, QoS::AtLeastOnce, retain, payload).await {
            warn!(%topic, "metrics publish failed: {e}");
        }
    }
}
