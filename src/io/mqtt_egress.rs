//! MQTT publisher for escalations
//!
//! Publishes queued high-priority escalations to the configured topic
//! (QoS 1) for downstream notification systems.

use crate::infra::config::EscalationConfig;
use crate::io::escalation::EscalationMessage;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// MQTT publisher actor
///
/// Receives messages from the escalation queue and publishes them.
pub struct MqttPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<EscalationMessage>,
    topic: String,
}

impl MqttPublisher {
    /// Connects to the broker at the configured host/port
    pub fn new(config: &EscalationConfig, rx: mpsc::Receiver<EscalationMessage>) -> Self {
        let client_id = format!("{}-{}", config.client_id, std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_escalation_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_escalation_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_escalation_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { client, rx, topic: config.topic.clone() }
    }

    /// Run until shutdown, draining queued escalations before returning
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(topic = %self.topic, "mqtt_escalation_started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("mqtt_escalation_shutdown");
                        while let Ok(msg) = self.rx.try_recv() {
                            self.publish_message(msg).await;
                        }
                        return;
                    }
                }
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.publish_message(msg).await,
                    None => return,
                },
            }
        }
    }

    async fn publish_message(&self, msg: EscalationMessage) {
        let json = match serde_json::to_string(&msg) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "mqtt_escalation_serialize_failed");
                return;
            }
        };
        match self.client.publish(&self.topic, QoS::AtLeastOnce, false, json.as_bytes()).await {
            Ok(()) => debug!(subject = %msg.subject, "mqtt_escalation_published"),
            Err(e) => error!(subject = %msg.subject, error = %e, "mqtt_escalation_failed"),
        }
    }
}
