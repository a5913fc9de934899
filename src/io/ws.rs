//! WebSocket real-time feed
//!
//! One session per connection. Each session registers with the
//! `SubscriberRegistry`, replies to client control messages, forwards
//! pushed events and sends a ping frame every heartbeat interval.
//!
//! Client messages (JSON, tagged by `type`):
//! - `{"type":"subscribe","geofenceId":"gf-1"}` - one geofence; `"all"` or no id for every event
//! - `{"type":"unsubscribe"}` - stay connected, stop pushed events
//! - `{"type":"ping"}` - answered with `pong`

use crate::domain::types::GeofenceId;
use crate::services::subscribers::{ServerMessage, SubscriberId, SubscriberRegistry, Subscription};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(rename = "geofenceId", default)]
        geofence_id: Option<String>,
    },
    Unsubscribe,
    Ping,
}

const KNOWN_TYPES: [&str; 3] = ["subscribe", "unsubscribe", "ping"];

/// Parse a client text frame; the error is the message sent back to the client
pub fn parse_client_message(text: &str) -> Result<ClientMessage, String> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| "Invalid message format".to_string())?;
    let Some(kind) = value.get("type").and_then(|t| t.as_str()) else {
        return Err("Invalid message format".to_string());
    };
    if !KNOWN_TYPES.contains(&kind) {
        return Err(format!("Unknown message type: {kind}"));
    }
    serde_json::from_value(value).map_err(|_| "Invalid message format".to_string())
}

/// Apply a client frame to the subscriber and build the reply
pub fn handle_client_text(registry: &SubscriberRegistry, id: SubscriberId, text: &str) -> ServerMessage {
    let timestamp = Utc::now();
    let message = match parse_client_message(text) {
        Ok(message) => message,
        Err(message) => {
            debug!(subscriber_id = %id, error = %message, "ws_client_message_rejected");
            return ServerMessage::Error { message, timestamp };
        }
    };

    match message {
        ClientMessage::Subscribe { geofence_id } => match geofence_id.filter(|g| g != "all") {
            Some(geofence_id) => {
                let geofence_id = GeofenceId(geofence_id);
                registry.set_subscription(id, Subscription::Geofence(geofence_id.clone()));
                ServerMessage::Subscribed {
                    message: format!("Subscribed to {geofence_id}"),
                    geofence_id: Some(geofence_id),
                    timestamp,
                }
            }
            None => {
                registry.set_subscription(id, Subscription::All);
                ServerMessage::Subscribed {
                    message: "Subscribed to all alerts".to_string(),
                    geofence_id: None,
                    timestamp,
                }
            }
        },
        ClientMessage::Unsubscribe => {
            registry.set_subscription(id, Subscription::Muted);
            ServerMessage::Unsubscribed { message: "Unsubscribed from alerts".to_string(), timestamp }
        }
        ClientMessage::Ping => ServerMessage::Pong { timestamp },
    }
}

fn to_frame(message: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            warn!(error = %e, "ws_message_serialize_failed");
            None
        }
    }
}

/// Drive one WebSocket connection until either side closes or shutdown
pub async fn serve_socket<S>(
    ws: WebSocketStream<S>,
    registry: Arc<SubscriberRegistry>,
    heartbeat: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (id, mut events) = registry.register();
    let (mut sink, mut stream) = ws.split();

    let hello = ServerMessage::Connection {
        message: "Connected to geofence alerts".to_string(),
        timestamp: Utc::now(),
    };
    if let Some(frame) = to_frame(&hello) {
        if sink.send(frame).await.is_err() {
            registry.unregister(id);
            return;
        }
    }

    let mut heartbeat = interval(heartbeat);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Some(frame) = to_frame(&event) {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_client_text(&registry, id, &text);
                    if let Some(frame) = to_frame(&reply) {
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Ping replies are queued by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(subscriber_id = %id, error = %e, "ws_read_error");
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    registry.unregister(id);
    info!(subscriber_id = %id, "ws_session_closed");
}
