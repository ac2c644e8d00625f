use std::time::Duration;

use log::{debug, error, info, warn};
use luba_sync::error::RefreshError;
use luba_sync::messages::{MowerAction, MowerRequest};
use luba_sync::mower::MowerStatus;
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use serde_derive::Serialize;
use tokio::sync::broadcast;

use crate::config;

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct FailureMqttMessage {
    kind: &'static str,
    message: String,
    consecutive_failures: u32,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "luba-sync".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config.topic_path.clone().unwrap_or_else(|| "luba".to_string()),
            },
            eventloop,
        )
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe_many(vec![SubscribeFilter::new(
                format!("{}/+/command", self.topic_path),
                QoS::AtLeastOnce,
            )])
            .await?;

        Ok(())
    }

    /// Drives the MQTT connection, forwarding command messages to `tx` until
    /// the client is disconnected.
    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: broadcast::Sender<MowerRequest>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        let Some(device) = device_from_topic(&self.topic_path, &p.topic) else {
                            continue;
                        };
                        let Some(action) = MowerAction::parse(&p.payload) else {
                            warn!("Ignoring unknown command {:?} for {}", p.payload, device);
                            continue;
                        };

                        if let Err(err) = tx.send(MowerRequest { device, action }) {
                            error!("Error dispatching mower command: {:?}", err);
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    rumqttc::Event::Outgoing(rumqttc::Outgoing::Disconnect) => {
                        debug!("MQTT client disconnected");
                        break;
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn device_topic(&self, name: &str, leaf: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.topic_path,
            self.publisher_id,
            sanitize_name(name),
            leaf
        )
    }

    pub async fn publish_status(&self, status: &MowerStatus) -> anyhow::Result<()> {
        info!("Announcing {} as {:?} on MQTT", status.name, status.activity);
        let payload = serde_json::to_string(status)?;
        self.client
            .publish(self.device_topic(&status.name, "state"), QoS::AtLeastOnce, true, payload)
            .await?;
        Ok(())
    }

    pub async fn publish_failure(
        &self,
        name: &str,
        error: &RefreshError,
        consecutive_failures: u32,
    ) -> anyhow::Result<()> {
        let message = FailureMqttMessage {
            kind: error.kind(),
            message: error.to_string(),
            consecutive_failures,
        };
        self.client
            .publish(
                self.device_topic(name, "error"),
                QoS::AtMostOnce,
                false,
                serde_json::to_string(&message)?,
            )
            .await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

/// Device segment of `<topic_path>/<device>/command`.
fn device_from_topic(topic_path: &str, topic: &str) -> Option<String> {
    let device = topic
        .strip_prefix(topic_path)?
        .strip_prefix('/')?
        .strip_suffix("/command")?;
    (!device.is_empty() && !device.contains('/')).then(|| device.to_string())
}

pub fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}
