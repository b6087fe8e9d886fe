use crate::channel::LinkState;
use crate::config::Config;
use crate::correlator::Resolution;
use crate::errors::{Error, Result};
use crate::matcher::ResponseMatcher;
use crate::metrics::{
    CHANNEL_FULL_TOTAL, INVALID_READINGS_TOTAL, MESSAGES_TOTAL, STATUS_MESSAGES_TOTAL,
    VALID_READINGS_TOTAL,
};
use crate::model::{RawTelemetry, SensorReading};
use crate::topics::{InboundTopic, Topics};
use crate::validate::validate;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;

pub fn mqtt_options(config: &Config) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_broker.clone(),
        config.mqtt_port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(false);
    if let Some(username) = &config.mqtt_username {
        mqtt_options.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    mqtt_options
}

/// Dispatches inbound publishes by topic kind.
pub struct MessageRouter {
    topics: Topics,
    telemetry_tx: mpsc::Sender<SensorReading>,
    matcher: ResponseMatcher,
}

impl MessageRouter {
    pub fn new(
        topics: Topics,
        telemetry_tx: mpsc::Sender<SensorReading>,
        matcher: ResponseMatcher,
    ) -> Self {
        Self {
            topics,
            telemetry_tx,
            matcher,
        }
    }

    /// Handles one inbound message. Per-message failures are logged and
    /// counted here so the consumer loop keeps going.
    pub async fn route(&self, topic: &str, payload: &[u8]) {
        match self.topics.classify(topic) {
            Some(InboundTopic::Telemetry { device_id }) => {
                if let Err(e) =
                    process_telemetry_with_retry(device_id, payload, &self.telemetry_tx).await
                {
                    warn!(device_id = %device_id, "Rejected telemetry: {}", e);
                    INVALID_READINGS_TOTAL.inc();
                }
            }
            Some(InboundTopic::Status { device_id }) => {
                STATUS_MESSAGES_TOTAL.inc();
                debug!(
                    device_id = %device_id,
                    "Device status: {}",
                    String::from_utf8_lossy(payload)
                );
            }
            Some(InboundTopic::Response {
                device_id,
                command_id,
            }) => match self.matcher.handle(device_id, command_id, payload) {
                Some(Resolution::Applied(command)) => debug!(
                    device_id = %device_id,
                    command_id = %command.command_id,
                    "Command settled as {}", command.status
                ),
                Some(Resolution::Discarded(status)) => debug!(
                    device_id = %device_id,
                    command_id = %command_id,
                    "Response ignored, command already {}", status
                ),
                None => {}
            },
            None => {
                debug!("Ignoring message on unexpected topic {}", topic);
            }
        }
    }
}

pub async fn run_mqtt(
    client: AsyncClient,
    mut eventloop: EventLoop,
    link: LinkState,
    router: MessageRouter,
) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker");
                link.set_connected(true);
                // Requests are queued to this same event loop, so never await here.
                for filter in router.topics.subscriptions() {
                    client
                        .try_subscribe(filter.as_str(), QoS::AtLeastOnce)
                        .map_err(Error::Mqtt)?;
                    info!("Subscribed to {} with QoS 1", filter);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                MESSAGES_TOTAL.inc();

                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );

                router.route(&publish.topic, &publish.payload).await;
            }
            Ok(_) => {}
            Err(e) => {
                link.set_connected(false);
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Process a telemetry message with exponential backoff retry
async fn process_telemetry_with_retry(
    device_id: &str,
    payload: &[u8],
    tx: &mpsc::Sender<SensorReading>,
) -> Result<()> {
    let mut attempt = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        match process_telemetry(device_id, payload, tx).await {
            Ok(()) => {
                if attempt > 1 {
                    info!("Message processed successfully on attempt {}", attempt);
                }
                return Ok(());
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    return Err(e);
                }

                if !is_retryable_error(&e) {
                    return Err(e);
                }

                warn!(
                    "Message processing failed (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, MAX_RETRIES, e, backoff_ms
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

/// Parse, validate and enqueue a single telemetry message
async fn process_telemetry(
    device_id: &str,
    payload: &[u8],
    tx: &mpsc::Sender<SensorReading>,
) -> Result<()> {
    let raw = serde_json::from_slice::<RawTelemetry>(payload)
        .map_err(|e| Error::Validation(format!("JSON parse error: {}", e)))?;

    let reading = validate(raw)?;
    if reading.device_id != device_id {
        return Err(Error::Validation(format!(
            "payload deviceID {} does not match topic device {}",
            reading.device_id, device_id
        )));
    }

    match tx.try_send(reading) {
        Ok(()) => {
            VALID_READINGS_TOTAL.inc();
            Ok(())
        }
        Err(mpsc::error::TrySendError::Full(reading)) => {
            CHANNEL_FULL_TOTAL.inc();
            debug!("Channel full, using blocking send");
            tx.send(reading).await.map_err(|_| Error::ChannelSend)?;
            VALID_READINGS_TOTAL.inc();
            Ok(())
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error!("Channel closed, cannot send reading");
            Err(Error::ChannelSend)
        }
    }
}

fn is_retryable_error(error: &Error) -> bool {
    matches!(error, Error::ChannelSend | Error::Database(_))
}
