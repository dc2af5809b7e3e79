//! Video wall viewer: subscribes to the detection and status topics and
//! logs a per-source activity summary. Best-effort consumer; a malformed
//! payload is logged and skipped, never fatal.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use nvr_common::{topics, DetectionEvent, StatusMessage};

const SUMMARY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "nvr-videowall", about = "Terminal viewer for NVR detection topics")]
struct Cli {
    #[arg(long, default_value = "localhost")]
    mqtt_host: String,

    #[arg(long, default_value_t = 1883)]
    mqtt_port: u16,

    #[arg(long, default_value = "nvr/detections")]
    detection_prefix: String,

    #[arg(long, default_value = "nvr/control/status")]
    status_prefix: String,
}

#[derive(Debug, Default)]
struct SourceStats {
    events: u64,
    detections: u64,
    model_id: String,
    window_events: u64,
}

impl SourceStats {
    fn record(&mut self, event: &DetectionEvent) {
        self.events += 1;
        self.window_events += 1;
        self.detections += event.detections.len() as u64;
        self.model_id = event.model_id.clone();
    }
}

#[derive(Debug, Default)]
struct Wall {
    sources: HashMap<u32, SourceStats>,
    instances: HashMap<String, String>,
}

impl Wall {
    fn record_detection(&mut self, event: &DetectionEvent) {
        self.sources.entry(event.source_id).or_default().record(event);
    }

    fn record_status(&mut self, message: &StatusMessage) {
        self.instances
            .insert(message.instance_id.clone(), message.status.as_str().to_string());
    }

    fn drop_instance(&mut self, instance_id: &str) {
        self.instances.remove(instance_id);
    }

    fn summarize(&mut self, window: Duration) {
        let mut source_ids: Vec<u32> = self.sources.keys().copied().collect();
        source_ids.sort_unstable();
        for source_id in source_ids {
            if let Some(stats) = self.sources.get_mut(&source_id) {
                let fps = stats.window_events as f64 / window.as_secs_f64();
                info!(
                    source_id,
                    fps = format!("{fps:.1}"),
                    events = stats.events,
                    detections = stats.detections,
                    model = %stats.model_id,
                    "source"
                );
                stats.window_events = 0;
            }
        }
        let mut instances: Vec<(&String, &String)> = self.instances.iter().collect();
        instances.sort();
        for (instance_id, status) in instances {
            info!(instance = %instance_id, status = %status, "processor");
        }
    }
}

/// Instance id from `{status_prefix}/{instance}`; subtopics (ack, ping,
/// metrics) have a deeper path and are filtered out by the `+` wildcard.
fn instance_from_topic<'a>(topic: &'a str, status_prefix: &str) -> Option<&'a str> {
    topic.strip_prefix(status_prefix)?.strip_prefix('/')
}

fn source_from_topic(topic: &str, detection_prefix: &str) -> Option<u32> {
    topic
        .strip_prefix(detection_prefix)?
        .strip_prefix('/')?
        .parse()
        .ok()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!(host = %cli.mqtt_host, port = cli.mqtt_port, "videowall connecting");

    let client_id = format!("videowall_{}", Uuid::new_v4());
    let mut options = MqttOptions::new(client_id, &cli.mqtt_host, cli.mqtt_port);
    options
        .set_keep_alive(Duration::from_secs(30))
        .set_clean_session(true);
    let (client, mut eventloop) = AsyncClient::new(options, 256);

    let detection_filter = topics::detection_wildcard(&cli.detection_prefix);
    let status_filter = topics::status_wildcard(&cli.status_prefix);
    client.subscribe(&detection_filter, QoS::AtMostOnce).await?;
    client.subscribe(&status_filter, QoS::AtLeastOnce).await?;
    info!(%detection_filter, %status_filter, "subscribed");

    let mut wall = Wall::default();
    let mut last_summary = Instant::now();

    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if let Some(source_id) =
                        source_from_topic(&publish.topic, &cli.detection_prefix)
                    {
                        match serde_json::from_slice::<DetectionEvent>(&publish.payload) {
                            Ok(event) => {
                                debug_assert_eq!(event.source_id, source_id);
                                wall.record_detection(&event);
                            }
                            Err(e) => debug!(topic = %publish.topic, "bad detection payload: {e}"),
                        }
                    } else if let Some(instance_id) =
                        instance_from_topic(&publish.topic, &cli.status_prefix)
                    {
                        if publish.payload.is_empty() {
                            // Cleared retained slot: the instance was renamed.
                            wall.drop_instance(instance_id);
                        } else {
                            match serde_json::from_slice::<StatusMessage>(&publish.payload) {
                                Ok(message) => wall.record_status(&message),
                                Err(e) => debug!(topic = %publish.topic, "bad status payload: {e}"),
                            }
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("connection error: {e}; retrying");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("videowall stopping");
                break;
            }
        }

        if last_summary.elapsed() >= SUMMARY_INTERVAL {
            wall.summarize(last_summary.elapsed());
            last_summary = Instant::now();
        }
    }

    client.disconnect().await.ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nvr_common::ProcessorStatus;

    fn event(source_id: u32, model: &str, detections: usize) -> DetectionEvent {
        DetectionEvent {
            source_id,
            frame_id: 1,
            timestamp: Utc::now(),
            model_id: model.to_string(),
            inference_time_ms: 10.0,
            detections: vec![
                nvr_common::Detection {
                    class_name: "person".to_string(),
                    confidence: 0.9,
                    bbox: nvr_common::BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 20.0 },
                    tracker_id: None,
                };
                detections
            ],
            fps: None,
            latency_ms: None,
        }
    }

    #[test]
    fn test_topic_parsing() {
        assert_eq!(source_from_topic("nvr/detections/3", "nvr/detections"), Some(3));
        assert_eq!(source_from_topic("nvr/detections/x", "nvr/detections"), None);
        assert_eq!(source_from_topic("other/3", "nvr/detections"), None);
        assert_eq!(
            instance_from_topic("nvr/control/status/node-a", "nvr/control/status"),
            Some("node-a")
        );
        assert_eq!(instance_from_topic("nvr/detections/3", "nvr/control/status"), None);
    }

    #[test]
    fn test_wall_accumulates_per_source() {
        let mut wall = Wall::default();
        wall.record_detection(&event(0, "m1", 2));
        wall.record_detection(&event(0, "m2", 1));
        wall.record_detection(&event(4, "m1", 0));

        let stats = &wall.sources[&0];
        assert_eq!(stats.events, 2);
        assert_eq!(stats.detections, 3);
        assert_eq!(stats.model_id, "m2");
        assert_eq!(wall.sources[&4].events, 1);
    }

    #[test]
    fn test_wall_tracks_instances_and_rename_clears() {
        let mut wall = Wall::default();
        wall.record_status(&StatusMessage::now(ProcessorStatus::Running, "node-a"));
        assert_eq!(wall.instances["node-a"], "running");
        wall.drop_instance("node-a");
        assert!(wall.instances.is_empty());
    }
}
