use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nvr_processor::pipeline::synthetic::SyntheticFactory;
use nvr_processor::{Processor, ProcessorConfig};

#[derive(Debug, Parser)]
#[command(name = "nvr-processor", about = "Headless NVR inference control node")]
struct Cli {
    /// TOML configuration file; NVR_* environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    instance_id: Option<String>,

    #[arg(long)]
    mqtt_host: Option<String>,

    #[arg(long)]
    mqtt_port: Option<u16>,

    /// Model id passed to the inference pipeline.
    #[arg(long)]
    model: Option<String>,

    /// Stream source id; repeat for multiple sources.
    #[arg(long = "source")]
    sources: Vec<u32>,

    /// Per-source FPS cap; 0 means unbounded.
    #[arg(long)]
    max_fps: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ProcessorConfig::load(cli.config.as_deref())?;
    if let Some(instance_id) = cli.instance_id {
        config.instance_id = instance_id;
    }
    if let Some(host) = cli.mqtt_host {
        config.mqtt.host = host;
    }
    if let Some(port) = cli.mqtt_port {
        config.mqtt.port = port;
    }
    if let Some(model) = cli.model {
        config.model_id = model;
    }
    if !cli.sources.is_empty() {
        config.stream_source_ids = cli.sources;
    }
    if let Some(max_fps) = cli.max_fps {
        config.max_fps = max_fps;
    }
    config.validate()?;

    info!(
        instance_id = %config.instance_id,
        broker = %config.mqtt.host,
        sources = ?config.stream_source_ids,
        model = %config.model_id,
        "nvr processor starting"
    );

    let factory = Box::new(SyntheticFactory::new(Duration::from_millis(
        config.engine.connect_delay_ms,
    )));
    Processor::new(config).run(factory).await
}
