//! Vehicle position sources
//!
//! - `InMemoryLocationStore` - positions pushed in-process (API, tests)
//! - `TrackStoreClient` - HTTP client for the trackstore service

use crate::domain::types::{VehicleId, VehicleLocation};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use std::future::Future;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Most recent position of one vehicle
    async fn latest(&self, vehicle_id: &VehicleId) -> Result<Option<VehicleLocation>, StoreError>;

    /// Latest position of every vehicle observed at or after `since`
    async fn recent(&self, since: DateTime<Utc>) -> Result<Vec<VehicleLocation>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryLocationStore {
    latest: RwLock<FxHashMap<VehicleId, VehicleLocation>>,
}

impl InMemoryLocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a position unless a newer one is already held
    pub fn upsert(&self, location: VehicleLocation) {
        let mut latest = self.latest.write();
        match latest.get(&location.vehicle_id) {
            Some(existing) if existing.observed_at > location.observed_at => {}
            _ => {
                latest.insert(location.vehicle_id.clone(), location);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.latest.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.read().is_empty()
    }
}

#[async_trait]
impl LocationStore for InMemoryLocationStore {
    async fn latest(&self, vehicle_id: &VehicleId) -> Result<Option<VehicleLocation>, StoreError> {
        Ok(self.latest.read().get(vehicle_id).cloned())
    }

    async fn recent(&self, since: DateTime<Utc>) -> Result<Vec<VehicleLocation>, StoreError> {
        let mut found: Vec<VehicleLocation> =
            self.latest.read().values().filter(|l| l.observed_at >= since).cloned().collect();
        found.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
        Ok(found)
    }
}

/// Location record as served by trackstore (`busId`, `lat`, `lon`, `ts` in ms)
#[derive(Debug, Deserialize)]
struct LocationRecord {
    #[serde(alias = "busId")]
    device_id: String,
    #[serde(alias = "lat")]
    latitude: f64,
    #[serde(alias = "lon")]
    longitude: f64,
    #[serde(alias = "ts")]
    timestamp: i64,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    heading: Option<f64>,
}

impl LocationRecord {
    fn into_location(self) -> Option<VehicleLocation> {
        let observed_at = DateTime::from_timestamp_millis(self.timestamp)?;
        Some(VehicleLocation {
            vehicle_id: VehicleId(self.device_id),
            latitude: self.latitude,
            longitude: self.longitude,
            // Missing values are NaN so the ETA engine treats them as no signal
            speed_kmh: self.speed.unwrap_or(f64::NAN),
            heading_deg: self.heading.unwrap_or(f64::NAN),
            observed_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct DeviceStatus {
    device_id: String,
    #[serde(default)]
    last_seen: Option<i64>,
}

pub struct TrackStoreClient {
    base_url: String,
    client: reqwest::Client,
    /// Upper bound on concurrent `/latest` requests per sweep
    max_in_flight: usize,
}

impl TrackStoreClient {
    pub fn new(base_url: &str, timeout: Duration, max_in_flight: usize) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            max_in_flight: max_in_flight.max(1),
        })
    }

    async fn get_bytes(&self, path: &str) -> Result<Option<bytes::Bytes>, StoreError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StoreError::Unavailable(format!("{} returned {}", url, response.status())));
        }
        let body = response.bytes().await.map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Some(body))
    }
}

#[async_trait]
impl LocationStore for TrackStoreClient {
    async fn latest(&self, vehicle_id: &VehicleId) -> Result<Option<VehicleLocation>, StoreError> {
        let Some(body) = self.get_bytes(&format!("/locations/{}/latest", vehicle_id)).await? else {
            return Ok(None);
        };
        let record: LocationRecord = serde_json::from_slice(&body)?;
        Ok(record.into_location())
    }

    async fn recent(&self, since: DateTime<Utc>) -> Result<Vec<VehicleLocation>, StoreError> {
        let Some(body) = self.get_bytes("/devices").await? else {
            return Ok(Vec::new());
        };
        let devices: Vec<DeviceStatus> = serde_json::from_slice(&body)?;
        let since_ms = since.timestamp_millis();

        let active: Vec<VehicleId> = devices
            .into_iter()
            .filter(|d| d.last_seen.is_some_and(|seen| seen >= since_ms))
            .map(|d| VehicleId(d.device_id))
            .collect();
        debug!(active = %active.len(), "trackstore_devices_fetched");

        let results = fetch_bounded(&active, self.max_in_flight, |id| self.latest(id)).await;
        let mut locations = Vec::with_capacity(results.len());
        for (id, result) in results {
            match result {
                Ok(Some(location)) if location.observed_at >= since => locations.push(location),
                Ok(_) => {}
                Err(e) => warn!(vehicle_id = %id, error = %e, "trackstore_latest_failed"),
            }
        }
        Ok(locations)
    }
}

/// Run `fetch` for every id with at most `limit` calls outstanding.
///
/// Results come back in completion order.
fn fetch_bounded<'a, F, Fut, T>(
    ids: &'a [VehicleId],
    limit: usize,
    fetch: F,
) -> futures_util::future::BoxFuture<'a, Vec<(&'a VehicleId, T)>>
where
    F: Fn(&'a VehicleId) -> Fut + Send + 'a,
    Fut: Future<Output = T> + Send + 'a,
    T: Send + 'a,
{
    stream::iter(ids)
        .map(move |id: &'a VehicleId| {
            let call = fetch(id);
            async move { (id, call.await) }
        })
        .buffer_unordered(limit.max(1))
        .collect()
        .boxed()
}
