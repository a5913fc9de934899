//! IO modules - external system interfaces
//!
//! - `location_store` - vehicle positions (in-process or trackstore HTTP)
//! - `routing` - driving-time provider (Mapbox Directions)
//! - `geofence_persistence` - geofence records (in-memory or JSON snapshot)
//! - `alert_store` - durable alert log (JSONL) with TTL
//! - `escalation` - out-of-band channel for high priority alerts
//! - `mqtt_egress` - MQTT publisher draining the escalation queue
//! - `http` - management API, health, stats and `/metrics`
//! - `ws` - WebSocket real-time feed sessions
//! - `prometheus` - Prometheus text formatting

pub mod alert_store;
pub mod escalation;
pub mod geofence_persistence;
pub mod http;
pub mod location_store;
pub mod mqtt_egress;
pub mod prometheus;
pub mod routing;
pub mod ws;

// Re-export commonly used types
pub use alert_store::{AlertPersistence, InMemoryAlertStore, JsonlAlertStore};
pub use escalation::{escalation_channel, EscalationChannel, LogOnlyEscalation, MqttEscalation};
pub use geofence_persistence::{GeofencePersistence, InMemoryGeofences, JsonFileGeofences};
pub use http::{start_http_server, AppState};
pub use location_store::{InMemoryLocationStore, LocationStore, TrackStoreClient};
pub use mqtt_egress::MqttPublisher;
pub use routing::{MapboxRouting, RoutingProvider};
