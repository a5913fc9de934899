//! Error taxonomy shared by services and adapters
//!
//! - `ValidationError` - malformed geofence definitions, rejected at the API
//! - `GeofenceError` - store operations (not found / conflict / validation / backend)
//! - `StoreError` - transient persistence failures, logged and absorbed
//! - `RoutingError` - routing provider failures, absorbed by the ETA engine
//! - `EscalationError` - out-of-band delivery failures

use crate::domain::types::GeofenceId;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("geofence name must not be empty")]
    EmptyName,
    #[error("circle radius must be a positive number of meters, got {0}")]
    RadiusNotPositive(f64),
    #[error("polygon needs at least 3 points, got {0}")]
    TooFewPoints(usize),
    #[error("coordinate out of range: {lat},{lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },
    #[error("alert threshold must be greater than zero minutes")]
    ThresholdNotPositive,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum GeofenceError {
    #[error("geofence {0} not found")]
    NotFound(GeofenceId),
    #[error("geofence {0} already exists")]
    AlreadyExists(GeofenceId),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("routing request timed out")]
    Timeout,
    #[error("routing provider rate limit reached")]
    RateLimited,
    #[error("routing request failed: {0}")]
    Http(String),
    #[error("routing provider returned no route")]
    NoRoute,
}

#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error("escalation queue full")]
    ChannelFull,
    #[error("escalation channel closed")]
    ChannelClosed,
    #[error("escalation payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
