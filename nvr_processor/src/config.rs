use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;

/// Live configuration shared between the dispatch task (writers) and the
/// sink/reporter (readers). Command handlers are the only writers and run
/// serially, so readers only ever observe complete configurations.
pub type SharedConfig = Arc<RwLock<ProcessorConfig>>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("instance_id `{0}` is not usable as a topic segment")]
    InvalidInstanceId(String),
    #[error("stream_server must not be empty")]
    EmptyStreamServer,
    #[error("at least one stream source id is required")]
    NoSources,
    #[error("duplicate stream source id {0}")]
    DuplicateSource(u32),
    #[error("max_fps must be a finite value >= 0, got {0}")]
    InvalidMaxFps(f64),
    #[error("model_id must not be empty")]
    EmptyModelId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

/// Knobs for the built-in engine backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineConfig {
    /// Simulated per-pipeline connect time. Real RTSP sources take tens of
    /// seconds; commands must be accepted throughout.
    #[serde(default)]
    pub connect_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { connect_delay_ms: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    /// RTSP proxy base; the URI for source `n` is `{stream_server}/{n}`.
    #[serde(default = "default_stream_server")]
    pub stream_server: String,
    #[serde(default = "default_sources")]
    pub stream_source_ids: Vec<u32>,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// 0 means unbounded.
    #[serde(default = "default_max_fps")]
    pub max_fps: f64,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default = "default_command_topic")]
    pub control_command_topic: String,
    #[serde(default = "default_status_topic")]
    pub control_status_topic: String,
    #[serde(default = "default_metrics_topic")]
    pub metrics_topic: String,
    /// 0 disables the periodic metrics channel.
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_seconds: u64,
    #[serde(default = "default_detection_prefix")]
    pub detection_topic_prefix: String,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_instance_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("processor-{}", &suffix[..8])
}

fn default_stream_server() -> String {
    "rtsp://localhost:8554".to_string()
}

fn default_sources() -> Vec<u32> {
    vec![0]
}

fn default_model_id() -> String {
    "yolov8n-640".to_string()
}

fn default_max_fps() -> f64 {
    10.0
}

fn default_command_topic() -> String {
    "nvr/control/commands".to_string()
}

fn default_status_topic() -> String {
    "nvr/control/status".to_string()
}

fn default_metrics_topic() -> String {
    "nvr/status/metrics".to_string()
}

fn default_metrics_interval() -> u64 {
    30
}

fn default_detection_prefix() -> String {
    "nvr/detections".to_string()
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            stream_server: default_stream_server(),
            stream_source_ids: default_sources(),
            model_id: default_model_id(),
            max_fps: default_max_fps(),
            mqtt: MqttConfig::default(),
            control_command_topic: default_command_topic(),
            control_status_topic: default_status_topic(),
            metrics_topic: default_metrics_topic(),
            metrics_interval_seconds: default_metrics_interval(),
            detection_topic_prefix: default_detection_prefix(),
            engine: EngineConfig::default(),
        }
    }
}

impl ProcessorConfig {
    /// Load from an optional TOML file with `NVR_*` environment overrides
    /// (`NVR_MQTT__HOST`, `NVR_MODEL_ID`, ...).
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let cfg: ProcessorConfig = builder
            .add_source(
                config::Environment::with_prefix("NVR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !nvr_common::topics::is_valid_instance_id(&self.instance_id) {
            return Err(ConfigError::InvalidInstanceId(self.instance_id.clone()));
        }
        if self.stream_server.trim().is_empty() {
            return Err(ConfigError::EmptyStreamServer);
        }
        if self.stream_source_ids.is_empty() {
            return Err(ConfigError::NoSources);
        }
        let mut seen = std::collections::HashSet::new();
        for id in &self.stream_source_ids {
            if !seen.insert(*id) {
                return Err(ConfigError::DuplicateSource(*id));
            }
        }
        if self.model_id.trim().is_empty() {
            return Err(ConfigError::EmptyModelId);
        }
        if !self.max_fps.is_finite() || self.max_fps < 0.0 {
            return Err(ConfigError::InvalidMaxFps(self.max_fps));
        }
        Ok(())
    }

    /// Stream URI for one source. Always derived, never stored, so the
    /// proxy base can change without touching the source set.
    pub fn video_reference(&self, source_id: u32) -> String {
        format!("{}/{}", self.stream_server.trim_end_matches('/'), source_id)
    }

    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = ProcessorConfig::default();
        cfg.validate().unwrap();
        assert!(cfg.instance_id.starts_with("processor-"));
        assert_eq!(cfg.control_command_topic, "nvr/control/commands");
    }

    #[test]
    fn test_video_reference_derivation() {
        let mut cfg = ProcessorConfig::default();
        cfg.stream_server = "rtsp://proxy:8554/".to_string();
        assert_eq!(cfg.video_reference(4), "rtsp://proxy:8554/4");
    }

    #[test]
    fn test_rejects_duplicate_sources() {
        let mut cfg = ProcessorConfig::default();
        cfg.stream_source_ids = vec![0, 1, 0];
        assert!(matches!(cfg.validate(), Err(ConfigError::DuplicateSource(0))));
    }

    #[test]
    fn test_rejects_empty_sources() {
        let mut cfg = ProcessorConfig::default();
        cfg.stream_source_ids.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoSources)));
    }

    #[test]
    fn test_rejects_bad_instance_id() {
        let mut cfg = ProcessorConfig::default();
        cfg.instance_id = "cam/7".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidInstanceId(_))));
    }

    #[test]
    fn test_zero_max_fps_is_unbounded_and_valid() {
        let mut cfg = ProcessorConfig::default();
        cfg.max_fps = 0.0;
        cfg.validate().unwrap();
    }
}
