//! Real-time subscriber registry and fan-out
//!
//! Each subscriber owns a bounded queue. Broadcast never waits on a slow
//! consumer: a full queue drops the event for that subscriber only, and a
//! closed queue unregisters it.

use crate::domain::alert::Alert;
use crate::domain::eta::EtaResult;
use crate::domain::types::{AlertId, GeofenceId, VehicleId};
use crate::infra::metrics::Metrics;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

pub type SubscriberId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    All,
    Geofence(GeofenceId),
    /// Registered but receiving no pushed events
    Muted,
}

impl Subscription {
    fn wants(&self, geofence_id: &GeofenceId) -> bool {
        match self {
            Subscription::All => true,
            Subscription::Geofence(id) => id == geofence_id,
            Subscription::Muted => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EtaUpdate {
    pub vehicle_id: VehicleId,
    pub geofence_id: GeofenceId,
    pub eta: EtaResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    pub alert_id: AlertId,
    pub acknowledged_by: String,
    pub geofence_id: GeofenceId,
}

/// Events pushed to subscribers
#[derive(Debug, Clone)]
pub enum FeedEvent {
    GeofenceAlert(Alert),
    EtaUpdate(EtaUpdate),
    AlertAcknowledged(Acknowledgement),
}

impl FeedEvent {
    pub fn geofence_id(&self) -> &GeofenceId {
        match self {
            FeedEvent::GeofenceAlert(alert) => &alert.geofence_id,
            FeedEvent::EtaUpdate(update) => &update.geofence_id,
            FeedEvent::AlertAcknowledged(ack) => &ack.geofence_id,
        }
    }

    pub fn into_message(self, timestamp: DateTime<Utc>) -> ServerMessage {
        match self {
            FeedEvent::GeofenceAlert(data) => ServerMessage::GeofenceAlert { data, timestamp },
            FeedEvent::EtaUpdate(data) => ServerMessage::EtaUpdate { data, timestamp },
            FeedEvent::AlertAcknowledged(data) => {
                ServerMessage::AlertAcknowledged { data, timestamp }
            }
        }
    }
}

/// Everything the server sends over the feed, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connection {
        message: String,
        timestamp: DateTime<Utc>,
    },
    Subscribed {
        message: String,
        #[serde(rename = "geofenceId", skip_serializing_if = "Option::is_none")]
        geofence_id: Option<GeofenceId>,
        timestamp: DateTime<Utc>,
    },
    Unsubscribed {
        message: String,
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
    GeofenceAlert {
        data: Alert,
        timestamp: DateTime<Utc>,
    },
    EtaUpdate {
        data: EtaUpdate,
        timestamp: DateTime<Utc>,
    },
    AlertAcknowledged {
        data: Acknowledgement,
        timestamp: DateTime<Utc>,
    },
}

struct Subscriber {
    tx: mpsc::Sender<Arc<ServerMessage>>,
    subscription: Subscription,
}

pub struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: RwLock<FxHashMap<SubscriberId, Subscriber>>,
    buffer: usize,
    metrics: Arc<Metrics>,
}

impl SubscriberRegistry {
    pub fn new(buffer: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(FxHashMap::default()),
            buffer: buffer.max(1),
            metrics,
        }
    }

    /// New subscribers receive every event until they narrow their subscription
    pub fn register(&self) -> (SubscriberId, mpsc::Receiver<Arc<ServerMessage>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.write().insert(id, Subscriber { tx, subscription: Subscription::All });
        info!(subscriber_id = %id, "subscriber_registered");
        (id, rx)
    }

    pub fn set_subscription(&self, id: SubscriberId, subscription: Subscription) -> bool {
        match self.subscribers.write().get_mut(&id) {
            Some(subscriber) => {
                debug!(subscriber_id = %id, subscription = ?subscription, "subscription_changed");
                subscriber.subscription = subscription;
                true
            }
            None => false,
        }
    }

    pub fn unregister(&self, id: SubscriberId) {
        if self.subscribers.write().remove(&id).is_some() {
            info!(subscriber_id = %id, "subscriber_unregistered");
        }
    }

    /// Fan an event out to matching subscribers; returns how many accepted it
    pub fn broadcast(&self, event: FeedEvent) -> usize {
        let geofence_id = event.geofence_id().clone();
        let message = Arc::new(event.into_message(Utc::now()));

        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (id, subscriber) in subscribers.iter() {
                if !subscriber.subscription.wants(&geofence_id) {
                    continue;
                }
                match subscriber.tx.try_send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        self.metrics.record_broadcast_dropped();
                        debug!(subscriber_id = %id, "subscriber_queue_full");
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in closed {
                subscribers.remove(&id);
                debug!(subscriber_id = %id, "subscriber_closed_removed");
            }
        }
        delivered
    }

    /// Direct reply to one subscriber, ignoring its subscription
    pub fn send_to(&self, id: SubscriberId, message: ServerMessage) -> bool {
        let subscribers = self.subscribers.read();
        match subscribers.get(&id) {
            Some(subscriber) => subscriber.tx.try_send(Arc::new(message)).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(buffer: usize) -> (SubscriberRegistry, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        (SubscriberRegistry::new(buffer, metrics.clone()), metrics)
    }

    fn ack(geofence: &str) -> FeedEvent {
        FeedEvent::AlertAcknowledged(Acknowledgement {
            alert_id: AlertId::from("alert-1"),
            acknowledged_by: "dispatcher-7".to_string(),
            geofence_id: GeofenceId::from(geofence),
        })
    }

    #[tokio::test]
    async fn test_broadcast_respects_subscription() {
        let (registry, _) = registry(8);
        let (all_id, mut all_rx) = registry.register();
        let (one_id, mut one_rx) = registry.register();
        let (muted_id, mut muted_rx) = registry.register();
        assert!(registry.set_subscription(one_id, Subscription::Geofence(GeofenceId::from("gf-2"))));
        assert!(registry.set_subscription(muted_id, Subscription::Muted));

        assert_eq!(registry.broadcast(ack("gf-1")), 1);
        assert_eq!(registry.broadcast(ack("gf-2")), 2);

        assert!(matches!(*all_rx.recv().await.unwrap(), ServerMessage::AlertAcknowledged { .. }));
        assert!(all_rx.recv().await.is_some());
        let only = one_rx.recv().await.unwrap();
        match &*only {
            ServerMessage::AlertAcknowledged { data, .. } => {
                assert_eq!(data.geofence_id, GeofenceId::from("gf-2"))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(one_rx.try_recv().is_err());
        assert!(muted_rx.try_recv().is_err());
        assert_eq!(registry.len(), 3);
        let _ = all_id;
    }

    #[tokio::test]
    async fn test_full_subscriber_does_not_block_others() {
        let (registry, metrics) = registry(1);
        let (_slow, _slow_rx) = registry.register();
        let (_fast, mut fast_rx) = registry.register();

        assert_eq!(registry.broadcast(ack("gf-1")), 2);
        fast_rx.recv().await.unwrap();
        // Slow queue is still full; only the fast subscriber gets this one
        assert_eq!(registry.broadcast(ack("gf-1")), 1);
        assert_eq!(metrics.broadcast_dropped_total(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_removed() {
        let (registry, _) = registry(4);
        let (_id, rx) = registry.register();
        drop(rx);
        assert_eq!(registry.broadcast(ack("gf-1")), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_send_to_and_unregister() {
        let (registry, _) = registry(4);
        let (id, mut rx) = registry.register();
        assert!(registry.send_to(id, ServerMessage::Pong { timestamp: Utc::now() }));
        assert!(matches!(*rx.recv().await.unwrap(), ServerMessage::Pong { .. }));

        registry.unregister(id);
        assert!(!registry.send_to(id, ServerMessage::Pong { timestamp: Utc::now() }));
        assert!(!registry.set_subscription(id, Subscription::All));
    }

    #[test]
    fn test_server_message_wire_format() {
        let message = ServerMessage::Subscribed {
            message: "Subscribed to gf-1".to_string(),
            geofence_id: Some(GeofenceId::from("gf-1")),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "subscribed");
        assert_eq!(json["geofenceId"], "gf-1");

        let json = serde_json::to_value(ack("gf-1").into_message(Utc::now())).unwrap();
        assert_eq!(json["type"], "alert_acknowledged");
        assert_eq!(json["data"]["alertId"], "alert-1");
        assert_eq!(json["data"]["acknowledgedBy"], "dispatcher-7");
    }
}
