//! Road routing providers

use crate::domain::eta::RouteSummary;
use crate::domain::types::LatLon;
use crate::error::RoutingError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait RoutingProvider: Send + Sync {
    async fn route(&self, from: LatLon, to: LatLon) -> Result<RouteSummary, RoutingError>;
}

#[derive(Debug, Deserialize)]
struct DirectionsResponse {
    #[serde(default)]
    routes: Vec<DirectionsRoute>,
}

#[derive(Debug, Deserialize)]
struct DirectionsRoute {
    /// Seconds
    duration: f64,
    /// Meters
    distance: f64,
}

/// Mapbox Directions API (`/directions/v5/mapbox/{profile}/{lon,lat};{lon,lat}`)
pub struct MapboxRouting {
    base_url: String,
    profile: String,
    api_key: String,
    client: reqwest::Client,
}

impl MapboxRouting {
    pub fn new(
        base_url: &str,
        profile: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, RoutingError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RoutingError::Http(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            profile: profile.to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }

    fn url(&self, from: LatLon, to: LatLon) -> String {
        format!(
            "{}/directions/v5/mapbox/{}/{},{};{},{}",
            self.base_url, self.profile, from.lon, from.lat, to.lon, to.lat
        )
    }
}

#[async_trait]
impl RoutingProvider for MapboxRouting {
    async fn route(&self, from: LatLon, to: LatLon) -> Result<RouteSummary, RoutingError> {
        let response = self
            .client
            .get(self.url(from, to))
            .query(&[("access_token", self.api_key.as_str()), ("overview", "false")])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RoutingError::Timeout
                } else {
                    RoutingError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(RoutingError::RateLimited);
        }
        if !status.is_success() {
            return Err(RoutingError::Http(format!("status {}", status)));
        }

        let body = response.bytes().await.map_err(|e| RoutingError::Http(e.to_string()))?;
        parse_directions(&body)
    }
}

fn parse_directions(body: &[u8]) -> Result<RouteSummary, RoutingError> {
    let parsed: DirectionsResponse =
        serde_json::from_slice(body).map_err(|e| RoutingError::Http(e.to_string()))?;
    let route = parsed.routes.into_iter().next().ok_or(RoutingError::NoRoute)?;
    debug!(duration_s = %route.duration, distance_m = %route.distance, "route_received");
    Ok(RouteSummary { duration_seconds: route.duration, distance_meters: route.distance })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_uses_lon_lat_order() {
        let routing =
            MapboxRouting::new("https://api.mapbox.com/", "driving", "k", Duration::from_secs(3))
                .unwrap();
        let url = routing.url(LatLon::new(43.1, -80.1), LatLon::new(43.2, -80.2));
        assert_eq!(url, "https://api.mapbox.com/directions/v5/mapbox/driving/-80.1,43.1;-80.2,43.2");
    }

    #[test]
    fn test_parse_directions_first_route() {
        let body = br#"{"code":"Ok","routes":[{"duration":95.4,"distance":812.0},{"duration":200.0,"distance":900.0}]}"#;
        let route = parse_directions(body).unwrap();
        assert_eq!(route.duration_seconds, 95.4);
        assert_eq!(route.distance_meters, 812.0);
    }

    #[test]
    fn test_parse_directions_no_route() {
        let body = br#"{"code":"NoRoute","routes":[]}"#;
        assert!(matches!(parse_directions(body), Err(RoutingError::NoRoute)));
    }
}
