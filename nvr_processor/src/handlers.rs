//! Command handlers.
//!
//! Handlers are thin: validation, config mutation and rollback live here;
//! lifecycle work is delegated to the pipeline manager. Every
//! reconfiguring command flows through the same template so there is
//! exactly one restart path.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use nvr_common::{topics, CommandParams, ProcessorStatus};

use crate::config::{ProcessorConfig, SharedConfig};
use crate::control::{ControlPlane, ControlPublisher};
use crate::error::CommandError;
use crate::manager::PipelineManager;
use crate::processor::ShutdownHandle;
use crate::reporter::MetricsReporter;
use crate::sink::DetectionSink;

/// Everything a handler may touch.
pub struct CommandContext {
    pub config: SharedConfig,
    pub manager: Arc<PipelineManager>,
    pub sink: Arc<DetectionSink>,
    pub control: Arc<ControlPublisher>,
    pub reporter: Arc<MetricsReporter>,
    pub shutdown: Arc<ShutdownHandle>,
}

macro_rules! register {
    ($plane:expr, $ctx:expr, $name:literal, $handler:path) => {{
        let ctx = Arc::clone($ctx);
        $plane.register($name, move |params| {
            let ctx = Arc::clone(&ctx);
            async move { $handler(&ctx, params).await }
        });
    }};
}

pub fn register_all(plane: &mut ControlPlane, ctx: &Arc<CommandContext>) {
    register!(plane, ctx, "pause", pause);
    register!(plane, ctx, "resume", resume);
    register!(plane, ctx, "stop", stop);
    register!(plane, ctx, "status", status);
    register!(plane, ctx, "restart", restart);
    register!(plane, ctx, "change_model", change_model);
    register!(plane, ctx, "set_fps", set_fps);
    register!(plane, ctx, "add_stream", add_stream);
    register!(plane, ctx, "remove_stream", remove_stream);
    register!(plane, ctx, "ping", ping);
    register!(plane, ctx, "rename_instance", rename_instance);
    register!(plane, ctx, "metrics", metrics);
}

/// The reconfiguring template: snapshot, mutate, restart, restore on any
/// restart error so the config after a failed command is byte-equal to the
/// config before it.
async fn reconfigure<F>(ctx: &CommandContext, apply: F) -> Result<(), CommandError>
where
    F: FnOnce(&mut ProcessorConfig) -> Result<(), CommandError>,
{
    let backup = ctx.config.read().clone();
    apply(&mut ctx.config.write())?;
    match ctx.manager.restart_with_coordination().await {
        Ok(()) => Ok(()),
        Err(e) => {
            *ctx.config.write() = backup;
            Err(e)
        }
    }
}

async fn pause(ctx: &CommandContext, _params: CommandParams) -> Result<(), CommandError> {
    ctx.manager.pause()?;
    ctx.control.publish_status(ProcessorStatus::Paused).await;
    Ok(())
}

async fn resume(ctx: &CommandContext, _params: CommandParams) -> Result<(), CommandError> {
    ctx.manager.resume()?;
    ctx.control.publish_status(ProcessorStatus::Running).await;
    Ok(())
}

/// No drain: the sink gate closes first, then the pipeline is torn down,
/// so nothing publishes after the `stopped` status lands.
async fn stop(ctx: &CommandContext, _params: CommandParams) -> Result<(), CommandError> {
    if !ctx.manager.has_pipeline() {
        return Err(CommandError::NoPipeline);
    }
    ctx.sink.pause();
    ctx.manager.terminate().await;
    ctx.control.publish_status(ProcessorStatus::Stopped).await;
    ctx.shutdown.request();
    Ok(())
}

async fn status(ctx: &CommandContext, _params: CommandParams) -> Result<(), CommandError> {
    ctx.control.republish_last().await;
    Ok(())
}

async fn restart(ctx: &CommandContext, _params: CommandParams) -> Result<(), CommandError> {
    ctx.manager.restart_with_coordination().await
}

async fn change_model(ctx: &CommandContext, params: CommandParams) -> Result<(), CommandError> {
    let model_id = require_str(&params, "model_id")?;
    if model_id.trim().is_empty() {
        return Err(CommandError::InvalidModel(model_id));
    }
    info!(%model_id, "changing model");
    reconfigure(ctx, |config| {
        config.model_id = model_id;
        Ok(())
    })
    .await
}

async fn set_fps(ctx: &CommandContext, params: CommandParams) -> Result<(), CommandError> {
    let max_fps = require_f64(&params, "max_fps")?;
    if !max_fps.is_finite() || max_fps < 0.0 {
        return Err(CommandError::InvalidFps(max_fps));
    }
    info!(max_fps, "changing fps cap");
    reconfigure(ctx, |config| {
        config.max_fps = max_fps;
        Ok(())
    })
    .await
}

async fn add_stream(ctx: &CommandContext, params: CommandParams) -> Result<(), CommandError> {
    let source_id = require_source_id(&params)?;
    info!(source_id, "adding stream");
    reconfigure(ctx, |config| {
        if config.stream_source_ids.contains(&source_id) {
            return Err(CommandError::AlreadyPresent(source_id));
        }
        config.stream_source_ids.push(source_id);
        Ok(())
    })
    .await
}

async fn remove_stream(ctx: &CommandContext, params: CommandParams) -> Result<(), CommandError> {
    let source_id = require_source_id(&params)?;
    info!(source_id, "removing stream");
    reconfigure(ctx, |config| {
        if !config.stream_source_ids.contains(&source_id) {
            return Err(CommandError::NotPresent(source_id));
        }
        if config.stream_source_ids.len() == 1 {
            // The processor must never run with zero streams.
            return Err(CommandError::WouldBeEmpty(source_id));
        }
        config.stream_source_ids.retain(|id| *id != source_id);
        Ok(())
    })
    .await
}

async fn ping(ctx: &CommandContext, _params: CommandParams) -> Result<(), CommandError> {
    ctx.control.publish_ping_response().await;
    Ok(())
}

async fn rename_instance(ctx: &CommandContext, params: CommandParams) -> Result<(), CommandError> {
    let new_id = require_str(&params, "new_instance_id")?;
    if !topics::is_valid_instance_id(&new_id) {
        return Err(CommandError::InvalidName(new_id));
    }
    let old_id = ctx.config.read().instance_id.clone();
    info!(from = %old_id, to = %new_id, "renaming instance");
    if new_id != old_id {
        // Leave no ghost entry under the old name.
        ctx.control.clear_retained_status(&old_id).await;
    }
    ctx.config.write().instance_id = new_id;
    let current = ctx.control.last_status().status;
    ctx.control.publish_status(current).await;
    Ok(())
}

async fn metrics(ctx: &CommandContext, _params: CommandParams) -> Result<(), CommandError> {
    ctx.reporter.publish_full_report().await;
    Ok(())
}

fn require_str(params: &CommandParams, key: &'static str) -> Result<String, CommandError> {
    match params.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(CommandError::InvalidParam {
            name: key,
            reason: format!("expected a string, got {other}"),
        }),
        None => Err(CommandError::MissingParam(key)),
    }
}

fn require_f64(params: &CommandParams, key: &'static str) -> Result<f64, CommandError> {
    match params.get(key) {
        Some(Value::Number(n)) => n.as_f64().ok_or(CommandError::InvalidParam {
            name: key,
            reason: "not representable as f64".to_string(),
        }),
        Some(other) => Err(CommandError::InvalidParam {
            name: key,
            reason: format!("expected a number, got {other}"),
        }),
        None => Err(CommandError::MissingParam(key)),
    }
}

fn require_source_id(params: &CommandParams) -> Result<u32, CommandError> {
    match params.get("source_id") {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or(CommandError::InvalidParam {
                name: "source_id",
                reason: "expected a small non-negative integer".to_string(),
            }),
        Some(other) => Err(CommandError::InvalidParam {
            name: "source_id",
            reason: format!("expected an integer, got {other}"),
        }),
        None => Err(CommandError::MissingParam("source_id")),
    }
}
