//! Geofence definitions and their validation rules

use crate::domain::types::{GeofenceId, LatLon};
use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Spatial extent of a geofence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GeofenceShape {
    Circle {
        center: LatLon,
        #[serde(rename = "radiusMeters")]
        radius_meters: f64,
    },
    Polygon {
        /// Ordered ring, implicitly closed (last point connects to first)
        points: Vec<LatLon>,
    },
}

impl GeofenceShape {
    /// Reference point used for distance and bearing calculations.
    ///
    /// Circles use their center; polygons the average of their vertices.
    pub fn anchor(&self) -> LatLon {
        match self {
            GeofenceShape::Circle { center, .. } => *center,
            GeofenceShape::Polygon { points } => {
                if points.is_empty() {
                    return LatLon::new(0.0, 0.0);
                }
                let n = points.len() as f64;
                let (lat_sum, lon_sum) =
                    points.iter().fold((0.0, 0.0), |(la, lo), p| (la + p.lat, lo + p.lon));
                LatLon::new(lat_sum / n, lon_sum / n)
            }
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            GeofenceShape::Circle { center, radius_meters } => {
                check_coordinate(center)?;
                if !radius_meters.is_finite() || *radius_meters <= 0.0 {
                    return Err(ValidationError::RadiusNotPositive(*radius_meters));
                }
            }
            GeofenceShape::Polygon { points } => {
                if points.len() < 3 {
                    return Err(ValidationError::TooFewPoints(points.len()));
                }
                for point in points {
                    check_coordinate(point)?;
                }
            }
        }
        Ok(())
    }
}

fn check_coordinate(point: &LatLon) -> Result<(), ValidationError> {
    if point.is_valid() {
        Ok(())
    } else {
        Err(ValidationError::InvalidCoordinate { lat: point.lat, lon: point.lon })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeofenceCategory {
    BusStop,
    Depot,
    Maintenance,
    Restricted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    /// Timetabled arrival at this geofence, used for delay-based priority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_arrival: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geofence {
    pub id: GeofenceId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub shape: GeofenceShape,
    pub alert_threshold_minutes: u32,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<GeofenceCategory>,
    #[serde(default)]
    pub metadata: GeofenceMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Geofence {
    #[inline]
    pub fn anchor(&self) -> LatLon {
        self.shape.anchor()
    }

    #[inline]
    pub fn is_restricted(&self) -> bool {
        self.category == Some(GeofenceCategory::Restricted)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.alert_threshold_minutes == 0 {
            return Err(ValidationError::ThresholdNotPositive);
        }
        self.shape.validate()
    }
}

/// Request body for creating a geofence
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGeofence {
    /// Optional caller-chosen id (used for configured seeds)
    #[serde(default)]
    pub id: Option<GeofenceId>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub shape: GeofenceShape,
    pub alert_threshold_minutes: u32,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub category: Option<GeofenceCategory>,
    #[serde(default)]
    pub metadata: GeofenceMetadata,
}

fn default_active() -> bool {
    true
}

impl NewGeofence {
    pub fn into_geofence(self, now: DateTime<Utc>) -> Geofence {
        Geofence {
            id: self.id.unwrap_or_else(GeofenceId::generate),
            name: self.name,
            description: self.description,
            shape: self.shape,
            alert_threshold_minutes: self.alert_threshold_minutes,
            active: self.active,
            category: self.category,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update; absent fields keep their current value
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub shape: Option<GeofenceShape>,
    #[serde(default)]
    pub alert_threshold_minutes: Option<u32>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub category: Option<GeofenceCategory>,
    #[serde(default)]
    pub metadata: Option<GeofenceMetadata>,
}

impl GeofenceUpdate {
    pub fn apply(self, geofence: &mut Geofence, now: DateTime<Utc>) {
        if let Some(name) = self.name {
            geofence.name = name;
        }
        if let Some(description) = self.description {
            geofence.description = Some(description);
        }
        if let Some(shape) = self.shape {
            geofence.shape = shape;
        }
        if let Some(threshold) = self.alert_threshold_minutes {
            geofence.alert_threshold_minutes = threshold;
        }
        if let Some(active) = self.active {
            geofence.active = active;
        }
        if let Some(category) = self.category {
            geofence.category = Some(category);
        }
        if let Some(metadata) = self.metadata {
            geofence.metadata = metadata;
        }
        geofence.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circle(radius: f64) -> GeofenceShape {
        GeofenceShape::Circle { center: LatLon::new(43.4723, -80.5449), radius_meters: radius }
    }

    #[test]
    fn test_circle_validation() {
        assert!(circle(30.0).validate().is_ok());
        assert_eq!(circle(0.0).validate(), Err(ValidationError::RadiusNotPositive(0.0)));
        assert!(circle(-5.0).validate().is_err());
        assert!(circle(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_polygon_needs_three_points() {
        let shape = GeofenceShape::Polygon {
            points: vec![LatLon::new(43.0, -80.0), LatLon::new(43.1, -80.0)],
        };
        assert_eq!(shape.validate(), Err(ValidationError::TooFewPoints(2)));
    }

    #[test]
    fn test_polygon_anchor_is_vertex_centroid() {
        let shape = GeofenceShape::Polygon {
            points: vec![
                LatLon::new(0.0, 0.0),
                LatLon::new(0.0, 2.0),
                LatLon::new(2.0, 2.0),
                LatLon::new(2.0, 0.0),
            ],
        };
        assert_eq!(shape.anchor(), LatLon::new(1.0, 1.0));
    }

    #[test]
    fn test_shape_json_format() {
        let json = r#"{"type":"circle","center":{"lat":43.47,"lon":-80.54},"radiusMeters":50}"#;
        let shape: GeofenceShape = serde_json::from_str(json).unwrap();
        assert_eq!(
            shape,
            GeofenceShape::Circle { center: LatLon::new(43.47, -80.54), radius_meters: 50.0 }
        );
    }

    #[test]
    fn test_update_applies_only_present_fields() {
        let now = Utc::now();
        let mut geofence = NewGeofence {
            id: None,
            name: "Depot".to_string(),
            description: None,
            shape: circle(100.0),
            alert_threshold_minutes: 5,
            active: true,
            category: Some(GeofenceCategory::Depot),
            metadata: GeofenceMetadata::default(),
        }
        .into_geofence(now);

        GeofenceUpdate { alert_threshold_minutes: Some(3), ..Default::default() }
            .apply(&mut geofence, now);

        assert_eq!(geofence.name, "Depot");
        assert_eq!(geofence.alert_threshold_minutes, 3);
        assert_eq!(geofence.category, Some(GeofenceCategory::Depot));
    }

    #[test]
    fn test_geofence_validation_rejects_zero_threshold() {
        let mut geofence = NewGeofence {
            id: Some(GeofenceId::from("gf-1")),
            name: "Stop".to_string(),
            description: None,
            shape: circle(30.0),
            alert_threshold_minutes: 0,
            active: true,
            category: None,
            metadata: GeofenceMetadata::default(),
        }
        .into_geofence(Utc::now());
        assert_eq!(geofence.validate(), Err(ValidationError::ThresholdNotPositive));

        geofence.alert_threshold_minutes = 2;
        geofence.name = "  ".to_string();
        assert_eq!(geofence.validate(), Err(ValidationError::EmptyName));
    }
}
