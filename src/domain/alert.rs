//! Alert records emitted by the proximity monitor

use crate::domain::eta::EtaResult;
use crate::domain::geofence::Geofence;
use crate::domain::types::{AlertId, GeofenceId, VehicleId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Approaching,
    Entered,
    Exited,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Approaching => "approaching",
            AlertType::Entered => "entered",
            AlertType::Exited => "exited",
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_arrival: Option<DateTime<Utc>>,
}

/// What the monitor observed, before classification
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub vehicle_id: VehicleId,
    pub geofence: Geofence,
    pub alert_type: AlertType,
    pub eta: Option<EtaResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: AlertId,
    pub vehicle_id: VehicleId,
    pub geofence_id: GeofenceId,
    pub geofence_name: String,
    pub alert_type: AlertType,
    pub eta: Option<EtaResult>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: AlertMetadata,
}

impl Alert {
    pub fn acknowledge(&mut self, user_id: &str, at: DateTime<Utc>) {
        self.acknowledged = true;
        self.acknowledged_by = Some(user_id.to_string());
        self.acknowledged_at = Some(at);
    }
}
