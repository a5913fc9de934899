//! Out-of-band escalation for high-priority alerts
//!
//! The dispatcher hands escalations to an `EscalationChannel` without
//! waiting on delivery. The MQTT channel only enqueues; `MqttPublisher`
//! owns the broker connection.

use crate::error::EscalationError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::info;

#[async_trait]
pub trait EscalationChannel: Send + Sync {
    async fn publish(&self, subject: &str, payload: &str) -> Result<(), EscalationError>;
}

/// One queued escalation, as published to the broker
#[derive(Debug, Clone, Serialize)]
pub struct EscalationMessage {
    pub subject: String,
    /// JSON document describing the alert
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

/// Create the escalation queue
pub fn escalation_channel(
    queue_size: usize,
) -> (MqttEscalation, mpsc::Receiver<EscalationMessage>) {
    let (tx, rx) = mpsc::channel(queue_size.max(1));
    (MqttEscalation { tx }, rx)
}

#[derive(Clone)]
pub struct MqttEscalation {
    tx: mpsc::Sender<EscalationMessage>,
}

#[async_trait]
impl EscalationChannel for MqttEscalation {
    async fn publish(&self, subject: &str, payload: &str) -> Result<(), EscalationError> {
        let message = EscalationMessage {
            subject: subject.to_string(),
            payload: payload.to_string(),
            timestamp: Utc::now(),
        };
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => EscalationError::ChannelFull,
            TrySendError::Closed(_) => EscalationError::ChannelClosed,
        })
    }
}

/// Escalation sink used when no broker is configured
pub struct LogOnlyEscalation;

#[async_trait]
impl EscalationChannel for LogOnlyEscalation {
    async fn publish(&self, subject: &str, payload: &str) -> Result<(), EscalationError> {
        info!(subject = %subject, payload = %payload, "escalation_logged");
        Ok(())
    }
}
