//! Shared identifier and position types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Newtype wrapper for vehicle IDs to provide type safety
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleId(pub String);

impl std::fmt::Display for VehicleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VehicleId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Newtype wrapper for geofence IDs to provide type safety
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeofenceId(pub String);

impl GeofenceId {
    pub fn generate() -> Self {
        Self(format!("geofence-{}", new_uuid_v7()))
    }
}

impl std::fmt::Display for GeofenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GeofenceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Newtype wrapper for alert IDs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(pub String);

impl AlertId {
    pub fn generate() -> Self {
        Self(format!("alert-{}", new_uuid_v7()))
    }
}

impl std::fmt::Display for AlertId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AlertId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// WGS84 coordinate in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    #[inline]
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Finite and inside the valid latitude/longitude ranges
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

impl std::fmt::Display for LatLon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6},{:.6}", self.lat, self.lon)
    }
}

/// Latest observed position of a vehicle, as served by the location store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleLocation {
    pub vehicle_id: VehicleId,
    pub latitude: f64,
    pub longitude: f64,
    /// Ground speed in km/h
    #[serde(default)]
    pub speed_kmh: f64,
    /// Compass heading in degrees, 0 = north
    #[serde(default)]
    pub heading_deg: f64,
    pub observed_at: DateTime<Utc>,
}

impl VehicleLocation {
    pub fn new(
        vehicle_id: impl Into<VehicleId>,
        position: LatLon,
        speed_kmh: f64,
        heading_deg: f64,
    ) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            latitude: position.lat,
            longitude: position.lon,
            speed_kmh,
            heading_deg,
            observed_at: Utc::now(),
        }
    }

    #[inline]
    pub fn position(&self) -> LatLon {
        LatLon::new(self.latitude, self.longitude)
    }

    /// Whether speed and heading can be used to reason about motion
    pub fn has_motion_signal(&self) -> bool {
        self.speed_kmh.is_finite() && self.speed_kmh >= 0.0 && self.heading_deg.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_prefixed() {
        let a = AlertId::generate();
        let b = AlertId::generate();
        assert_ne!(a, b);
        assert!(a.0.starts_with("alert-"));
        assert!(GeofenceId::generate().0.starts_with("geofence-"));
    }

    #[test]
    fn test_latlon_validity() {
        assert!(LatLon::new(43.47, -80.54).is_valid());
        assert!(!LatLon::new(91.0, 0.0).is_valid());
        assert!(!LatLon::new(0.0, -180.5).is_valid());
        assert!(!LatLon::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_vehicle_location_serde_camel_case() {
        let json = r#"{
            "vehicleId": "bus-001",
            "latitude": 43.4723,
            "longitude": -80.5449,
            "speedKmh": 30.0,
            "headingDeg": 45.0,
            "observedAt": "2024-01-01T12:00:00Z"
        }"#;
        let location: VehicleLocation = serde_json::from_str(json).unwrap();
        assert_eq!(location.vehicle_id, VehicleId::from("bus-001"));
        assert_eq!(location.speed_kmh, 30.0);
        assert!(location.has_motion_signal());
    }
}
