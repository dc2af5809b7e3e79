//! MQTT transport layer.
//!
//! One connection serves both planes: the control plane subscribes to the
//! command topic and publishes status/acks at-least-once, while the data
//! plane fire-and-forgets detection events through the non-blocking
//! publish path. Command handlers never run on the event-loop task, so
//! keep-alives survive long restarts.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ProcessorConfig;
use crate::error::BusError;

const CONNECT_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const REQUEST_QUEUE_CAPACITY: usize = 256;

/// Publishing seam shared by the control publisher, the detection sink and
/// the metrics reporter. Test suites substitute a recording implementation.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Queue a publish and wait for the client to accept it.
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BusError>;

    /// Non-blocking publish for the fire-and-forget data plane. Fails
    /// instead of waiting when the request queue is full.
    fn try_publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BusError>;
}

/// Events surfaced to the command dispatch task.
#[derive(Debug)]
pub enum BusEvent {
    /// Payload received on the command topic.
    Command(Vec<u8>),
    /// The client reconnected; subscriptions were restored and the retained
    /// status should be re-asserted.
    Reconnected,
}

#[derive(Clone)]
pub struct BusHandle {
    client: AsyncClient,
}

impl BusHandle {
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BusError> {
        self.client
            .subscribe(topic, qos)
            .await
            .map_err(|e| BusError::SubscribeFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    pub async fn disconnect(&self) -> Result<(), BusError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| BusError::PublishFailed {
                topic: "$disconnect".to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl BusPublisher for BusHandle {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| BusError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn try_publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        self.client
            .try_publish(topic, qos, retain, payload)
            .map_err(|e| BusError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

pub struct BusConnection;

impl BusConnection {
    /// Connect to the broker, subscribe to the command topic and hand the
    /// event loop to a background task.
    ///
    /// Blocks until the first `ConnAck` or until the reconnect budget is
    /// exhausted, in which case startup fails with `BusError::Unavailable`.
    pub async fn connect(
        config: &ProcessorConfig,
    ) -> Result<(BusHandle, mpsc::Receiver<BusEvent>), BusError> {
        let options = mqtt_options(config);
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_QUEUE_CAPACITY);

        let mut attempts = 0u32;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(
                        host = %config.mqtt.host,
                        port = config.mqtt.port,
                        "connected to broker"
                    );
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    attempts += 1;
                    if attempts >= CONNECT_ATTEMPTS {
                        return Err(BusError::Unavailable {
                            attempts,
                            last_error: e.to_string(),
                        });
                    }
                    warn!(
                        attempt = attempts,
                        "broker not reachable ({e}); retrying in {:?}", backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        let command_topic = config.control_command_topic.clone();
        client
            .subscribe(&command_topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BusError::SubscribeFailed {
                topic: command_topic.clone(),
                reason: e.to_string(),
            })?;
        info!(topic = %command_topic, "subscribed to command topic");

        let (tx, rx) = mpsc::channel(64);
        let handle = BusHandle { client: client.clone() };
        tokio::spawn(run_event_loop(eventloop, client, command_topic, tx));
        Ok((handle, rx))
    }
}

fn mqtt_options(config: &ProcessorConfig) -> MqttOptions {
    let client_id = format!("{}_{}", config.instance_id, Uuid::new_v4());
    let mut options = MqttOptions::new(client_id, &config.mqtt.host, config.mqtt.port);
    options
        .set_keep_alive(Duration::from_secs(config.mqtt.keep_alive_secs))
        .set_clean_session(true);
    if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
        options.set_credentials(user, pass);
    }
    options
}

/// Background poll loop. Forwards command payloads, restores the command
/// subscription after an auto-reconnect, and backs off on transport errors.
async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    command_topic: String,
    tx: mpsc::Sender<BusEvent>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                backoff = INITIAL_BACKOFF;
                if publish.topic == command_topic {
                    if tx
                        .send(BusEvent::Command(publish.payload.to_vec()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                } else {
                    debug!(topic = %publish.topic, "ignoring message on unexpected topic");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff = INITIAL_BACKOFF;
                info!("reconnected to broker");
                // rumqttc does not restore subscriptions across reconnects.
                if let Err(e) = client.subscribe(&command_topic, QoS::AtLeastOnce).await {
                    error!("failed to resubscribe to {command_topic}: {e}");
                }
                if tx.send(BusEvent::Reconnected).await.is_err() {
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("bus event loop stopping after disconnect");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if tx.is_closed() {
                    break;
                }
                warn!("bus connection error: {e}; retrying in {:?}", backoff);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}
