use crate::errors::{Error, Result};
use crate::model::CommandMessage;
use crate::topics::Topics;
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Backend-to-device half of the pub/sub transport.
#[async_trait]
pub trait DeviceChannel: Send + Sync {
    async fn publish_command(&self, device_id: &str, message: &CommandMessage) -> Result<()>;
}

/// Broker connection state, shared between the event loop and publishers.
#[derive(Debug, Clone, Default)]
pub struct LinkState(Arc<AtomicBool>);

impl LinkState {
    pub fn set_connected(&self, connected: bool) {
        self.0.store(connected, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct MqttChannel {
    client: AsyncClient,
    topics: Topics,
    link: LinkState,
    publish_timeout: Duration,
}

impl MqttChannel {
    pub fn new(client: AsyncClient, topics: Topics, link: LinkState, publish_timeout: Duration) -> Self {
        Self {
            client,
            topics,
            link,
            publish_timeout,
        }
    }
}

#[async_trait]
impl DeviceChannel for MqttChannel {
    async fn publish_command(&self, device_id: &str, message: &CommandMessage) -> Result<()> {
        if !self.link.is_connected() {
            return Err(Error::Dispatch("MQTT broker is not connected".to_string()));
        }

        let payload = serde_json::to_vec(message)?;
        let topic = self.topics.command(device_id);

        match tokio::time::timeout(
            self.publish_timeout,
            self.client.publish(topic, QoS::AtLeastOnce, false, payload),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Dispatch(e.to_string())),
            Err(_) => Err(Error::Dispatch(format!(
                "publish did not complete within {:?}",
                self.publish_timeout
            ))),
        }
    }
}
