//! Control plane: command intake, acknowledgement lifecycle and retained
//! status.
//!
//! Every accepted command is acked `received` before its handler runs and
//! `completed` or `error` after it returns; status transitions ride the
//! retained per-instance topic so late subscribers see current state.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use nvr_common::{
    peek_command_name, topics, AckStatus, CommandAck, CommandEnvelope, CommandParams,
    PingResponse, ProcessorStatus, StatusMessage,
};

use crate::bus::{BusEvent, BusPublisher};
use crate::config::SharedConfig;
use crate::error::CommandError;

/// Publishes control-plane messages and remembers the last status so it can
/// be re-asserted after reconnects and `status` queries.
pub struct ControlPublisher {
    bus: Arc<dyn BusPublisher>,
    config: SharedConfig,
    last_status: Mutex<StatusMessage>,
}

impl ControlPublisher {
    pub fn new(bus: Arc<dyn BusPublisher>, config: SharedConfig) -> Arc<Self> {
        let instance_id = config.read().instance_id.clone();
        Arc::new(Self {
            bus,
            config,
            last_status: Mutex::new(StatusMessage::now(ProcessorStatus::Connected, instance_id)),
        })
    }

    pub fn last_status(&self) -> StatusMessage {
        self.last_status.lock().clone()
    }

    /// Publish a retained status transition. Transient publish failures are
    /// logged and swallowed; the at-least-once client retries delivery on
    /// its own once the request is queued.
    pub async fn publish_status(&self, status: ProcessorStatus) {
        let (topic, message) = {
            let config = self.config.read();
            (
                topics::status_topic(&config.control_status_topic, &config.instance_id),
                StatusMessage::now(status, config.instance_id.clone()),
            )
        };
        *self.last_status.lock() = message.clone();
        self.publish_json(&topic, QoS::AtLeastOnce, true, &message).await;
        info!(status = status.as_str(), "status published");
    }

    /// Re-assert the last known status, retained, without minting a new
    /// transition.
    pub async fn republish_last(&self) {
        let message = self.last_status();
        let topic = {
            let config = self.config.read();
            topics::status_topic(&config.control_status_topic, &config.instance_id)
        };
        self.publish_json(&topic, QoS::AtLeastOnce, true, &message).await;
    }

    pub async fn publish_ack(
        &self,
        command: &str,
        ack_status: AckStatus,
        error: Option<&CommandError>,
        correlation_id: Option<&str>,
    ) {
        let (topic, instance_id) = {
            let config = self.config.read();
            (
                topics::ack_topic(&config.control_status_topic, &config.instance_id),
                config.instance_id.clone(),
            )
        };
        let ack = CommandAck {
            command: command.to_string(),
            ack_status,
            timestamp: Utc::now(),
            instance_id,
            error_kind: error.map(|e| e.kind().to_string()),
            error_message: error.map(|e| e.to_string()),
            correlation_id: correlation_id.map(str::to_string),
        };
        self.publish_json(&topic, QoS::AtLeastOnce, false, &ack).await;
    }

    /// Discovery response for the `ping` command.
    pub async fn publish_ping_response(&self) {
        let (topic, response) = {
            let config = self.config.read();
            (
                topics::ping_topic(&config.control_status_topic, &config.instance_id),
                PingResponse {
                    instance_id: config.instance_id.clone(),
                    model_id: config.model_id.clone(),
                    stream_source_ids: config.stream_source_ids.clone(),
                    status: self.last_status.lock().status,
                },
            )
        };
        self.publish_json(&topic, QoS::AtLeastOnce, false, &response).await;
    }

    /// Clear the retained status slot of a previous instance id after a
    /// rename, so the old name does not linger on the wall.
    pub async fn clear_retained_status(&self, instance_id: &str) {
        let topic = {
            let config = self.config.read();
            topics::status_topic(&config.control_status_topic, instance_id)
        };
        if let Err(e) = self
            .bus
            .publish(&topic, QoS::AtLeastOnce, true, Vec::new())
            .await
        {
            warn!(%topic, "failed to clear retained status: {e}");
        }
    }

    async fn publish_json<T: serde::Serialize>(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        value: &T,
    ) {
        let payload = match serde_json::to_vec(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%topic, "failed to encode control message: {e}");
                return;
            }
        };
        if let Err(e) = self.bus.publish(topic, qos, retain, payload).await {
            warn!(%topic, "control publish failed: {e}");
        }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), CommandError>> + Send>>;
type Handler = Box<dyn Fn(CommandParams) -> HandlerFuture + Send + Sync>;

/// Explicit command registry plus the envelope contract.
pub struct ControlPlane {
    publisher: Arc<ControlPublisher>,
    config: SharedConfig,
    registry: HashMap<String, Handler>,
}

impl ControlPlane {
    pub fn new(publisher: Arc<ControlPublisher>, config: SharedConfig) -> Self {
        Self {
            publisher,
            config,
            registry: HashMap::new(),
        }
    }

    pub fn register<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(CommandParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CommandError>> + Send + 'static,
    {
        self.registry.insert(
            name.to_string(),
            Box::new(move |params| -> HandlerFuture { Box::pin(handler(params)) }),
        );
    }

    pub fn registered_commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.keys().cloned().collect();
        names.sort();
        names
    }

    /// Process one raw payload from the command topic.
    pub async fn dispatch(&self, payload: &[u8]) {
        let envelope = match CommandEnvelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                let command = peek_command_name(payload).unwrap_or_else(|| "unknown".to_string());
                warn!(%command, "discarding malformed command: {e}");
                self.publisher
                    .publish_ack(
                        &command,
                        AckStatus::Error,
                        Some(&CommandError::Decode(e.to_string())),
                        None,
                    )
                    .await;
                return;
            }
        };

        let instance_id = self.config.read().instance_id.clone();
        if !envelope.addressed_to(&instance_id) {
            debug!(
                command = %envelope.command,
                "command targets other instances; ignoring"
            );
            return;
        }

        let correlation_id = envelope.correlation_id.as_deref();
        self.publisher
            .publish_ack(&envelope.command, AckStatus::Received, None, correlation_id)
            .await;

        let Some(handler) = self.registry.get(&envelope.command) else {
            let err = CommandError::UnknownCommand(envelope.command.clone());
            warn!("{err}");
            self.publisher
                .publish_ack(&envelope.command, AckStatus::Error, Some(&err), correlation_id)
                .await;
            return;
        };

        info!(command = %envelope.command, "executing command");
        match handler(envelope.params.clone()).await {
            Ok(()) => {
                self.publisher
                    .publish_ack(&envelope.command, AckStatus::Completed, None, correlation_id)
                    .await;
            }
            Err(e) => {
                warn!(command = %envelope.command, kind = e.kind(), "command failed: {e}");
                self.publisher
                    .publish_ack(&envelope.command, AckStatus::Error, Some(&e), correlation_id)
                    .await;
            }
        }
    }

    /// Serial dispatch loop; this task is the only place handlers run, so
    /// config mutations need no further ordering discipline.
    pub async fn run(self, mut events: mpsc::Receiver<BusEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                BusEvent::Command(payload) => self.dispatch(&payload).await,
                BusEvent::Reconnected => self.publisher.republish_last().await,
            }
        }
        debug!("control plane dispatch loop ended");
    }
}
