//! Pure geometry over WGS84 coordinates
//!
//! All functions are deterministic and allocation-free.

use crate::domain::geofence::{Geofence, GeofenceShape};
use crate::domain::types::LatLon;

/// Mean Earth radius used by the haversine formula
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Great-circle distance in meters
pub fn distance_meters(a: LatLon, b: LatLon) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let d_phi = (b.lat - a.lat).to_radians();
    let d_lambda = (b.lon - a.lon).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_METERS * c
}

/// Initial bearing from `from` to `to`, in degrees within [0, 360)
pub fn bearing_degrees(from: LatLon, to: LatLon) -> f64 {
    let phi1 = from.lat.to_radians();
    let phi2 = to.lat.to_radians();
    let d_lambda = (to.lon - from.lon).to_radians();

    let y = d_lambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lambda.cos();
    let bearing = y.atan2(x).to_degrees().rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if bearing >= 360.0 {
        0.0
    } else {
        bearing
    }
}

/// Smallest angle between two compass directions, in [0, 180]
pub fn heading_deviation(heading: f64, bearing: f64) -> f64 {
    let diff = (heading - bearing).rem_euclid(360.0);
    if diff > 180.0 {
        360.0 - diff
    } else {
        diff
    }
}

/// Boundary counts as inside
#[inline]
pub fn point_in_circle(point: LatLon, center: LatLon, radius_meters: f64) -> bool {
    distance_meters(point, center) <= radius_meters
}

/// Ray-casting parity test, longitude as x and latitude as y.
///
/// Rings with fewer than three points contain nothing.
pub fn point_in_polygon(point: LatLon, polygon: &[LatLon]) -> bool {
    if polygon.len() < 3 {
        return false;
    }

    let (x, y) = (point.lon, point.lat);
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (xi, yi) = (polygon[i].lon, polygon[i].lat);
        let (xj, yj) = (polygon[j].lon, polygon[j].lat);
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Whether the geofence contains the point
pub fn contains(geofence: &Geofence, point: LatLon) -> bool {
    match &geofence.shape {
        GeofenceShape::Circle { center, radius_meters } => {
            point_in_circle(point, *center, *radius_meters)
        }
        GeofenceShape::Polygon { points } => point_in_polygon(point, points),
    }
}

/// Distance from the anchor to the furthest edge of the shape
pub fn reach_meters(shape: &GeofenceShape) -> f64 {
    match shape {
        GeofenceShape::Circle { radius_meters, .. } => *radius_meters,
        GeofenceShape::Polygon { points } => {
            let anchor = shape.anchor();
            points.iter().map(|p| distance_meters(anchor, *p)).fold(0.0, f64::max)
        }
    }
}
