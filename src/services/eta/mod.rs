//! Multi-strategy arrival estimation
//!
//! Strategy selection, from cheapest to most expensive:
//! - closer than `arrived_meters` - zero minutes, no external call
//! - no usable motion signal or stale fix - historical average speed
//! - further than `routing_max_distance_meters` - GPS projection
//! - moving and heading roughly at the geofence - routing provider, if the
//!   per-minute budget allows
//! - otherwise GPS projection
//!
//! One engine is built per process and shared; cache and rate limiter are
//! fields of the engine rather than globals.

pub mod cache;
pub mod rate_limiter;

use crate::domain::eta::{Confidence, EtaMethod, EtaResult};
use crate::domain::geofence::Geofence;
use crate::domain::types::{GeofenceId, LatLon, VehicleId, VehicleLocation};
use crate::error::{GeofenceError, RoutingError};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::location_store::LocationStore;
use crate::io::routing::RoutingProvider;
use crate::services::geofence_store::GeofenceStore;
use crate::services::spatial;
use cache::{CacheKey, EtaCache};
use chrono::Utc;
use parking_lot::Mutex;
use rate_limiter::RateLimiter;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

/// Extra time applied to projections when the vehicle is not heading at the target
const MISALIGNED_PENALTY: f64 = 1.3;
/// Projection confidence thresholds
const HIGH_CONFIDENCE_SPEED_KMH: f64 = 10.0;
const HIGH_CONFIDENCE_MAX_METERS: f64 = 2000.0;
const LOW_CONFIDENCE_MIN_METERS: f64 = 4000.0;

#[derive(Debug, Clone)]
pub struct EtaSettings {
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub arrived_meters: f64,
    pub routing_max_distance_meters: f64,
    pub routing_heading_tolerance_deg: f64,
    /// At or below this speed the vehicle is treated as stationary
    pub min_speed_kmh: f64,
    /// Assumed average speed for stationary vehicles and the historical fallback
    pub fallback_speed_kmh: f64,
    pub stale_after: Duration,
    pub routing_timeout: Duration,
    pub max_calls_per_minute: usize,
}

impl Default for EtaSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            cache_capacity: 1000,
            arrived_meters: 100.0,
            routing_max_distance_meters: 5000.0,
            routing_heading_tolerance_deg: 45.0,
            min_speed_kmh: 5.0,
            fallback_speed_kmh: 25.0,
            stale_after: Duration::from_secs(300),
            routing_timeout: Duration::from_secs(3),
            max_calls_per_minute: 20,
        }
    }
}

impl EtaSettings {
    pub fn from_config(config: &Config) -> Self {
        let eta = config.eta();
        let routing = config.routing();
        Self {
            cache_ttl: Duration::from_secs(eta.cache_ttl_secs),
            cache_capacity: eta.cache_capacity,
            arrived_meters: eta.arrived_meters,
            routing_max_distance_meters: eta.routing_max_distance_meters,
            routing_heading_tolerance_deg: eta.routing_heading_tolerance_deg,
            min_speed_kmh: eta.min_speed_kmh,
            fallback_speed_kmh: eta.fallback_speed_kmh,
            stale_after: Duration::from_secs(eta.stale_after_secs),
            routing_timeout: Duration::from_millis(routing.timeout_ms),
            max_calls_per_minute: routing.max_calls_per_minute,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EtaCacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub api_calls_in_window: usize,
    pub max_calls_per_minute: usize,
    pub rate_limited: bool,
}

pub struct EtaEngine {
    settings: EtaSettings,
    locations: Arc<dyn LocationStore>,
    geofences: Arc<GeofenceStore>,
    routing: Option<Arc<dyn RoutingProvider>>,
    metrics: Arc<Metrics>,
    cache: Mutex<EtaCache>,
    limiter: Mutex<RateLimiter>,
}

impl EtaEngine {
    pub fn new(
        settings: EtaSettings,
        locations: Arc<dyn LocationStore>,
        geofences: Arc<GeofenceStore>,
        routing: Option<Arc<dyn RoutingProvider>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let cache = EtaCache::new(settings.cache_ttl, settings.cache_capacity);
        let limiter = RateLimiter::per_minute(settings.max_calls_per_minute);
        Self {
            settings,
            locations,
            geofences,
            routing,
            metrics,
            cache: Mutex::new(cache),
            limiter: Mutex::new(limiter),
        }
    }

    /// Estimate for a vehicle and geofence by id.
    ///
    /// `None` when either is unknown or the lookup failed.
    pub async fn calculate_eta(
        &self,
        vehicle_id: &VehicleId,
        geofence_id: &GeofenceId,
    ) -> Option<EtaResult> {
        let location = match self.locations.latest(vehicle_id).await {
            Ok(Some(location)) => location,
            Ok(None) => return None,
            Err(e) => {
                warn!(vehicle_id = %vehicle_id, error = %e, "eta_location_lookup_failed");
                return None;
            }
        };

        let geofence = match self.geofences.get(geofence_id).await {
            Ok(geofence) => geofence,
            Err(GeofenceError::NotFound(_)) => return None,
            Err(e) => {
                warn!(geofence_id = %geofence_id, error = %e, "eta_geofence_lookup_failed");
                return None;
            }
        };

        Some(self.estimate(&location, &geofence).await)
    }

    /// Estimate for an already-fetched location and geofence
    pub async fn estimate(&self, location: &VehicleLocation, geofence: &Geofence) -> EtaResult {
        let origin = location.position();
        let anchor = geofence.anchor();
        let distance = spatial::distance_meters(origin, anchor);

        let key = CacheKey::new(origin, &geofence.id, location.speed_kmh);
        let cached = self.cache.lock().get(&key, Instant::now());
        if let Some(hit) = cached {
            debug!(vehicle_id = %location.vehicle_id, geofence_id = %geofence.id, "eta_cache_hit");
            return hit;
        }

        let result = self.compute(location, origin, anchor, distance).await;
        self.metrics.record_eta(result.method);
        debug!(
            vehicle_id = %location.vehicle_id,
            geofence_id = %geofence.id,
            minutes = %result.estimated_arrival_minutes,
            method = %result.method.as_str(),
            "eta_computed"
        );

        if result.confidence != Confidence::Low {
            self.cache.lock().insert(key, result.clone(), Instant::now());
        }
        result
    }

    async fn compute(
        &self,
        location: &VehicleLocation,
        origin: LatLon,
        anchor: LatLon,
        distance: f64,
    ) -> EtaResult {
        if distance < self.settings.arrived_meters {
            return EtaResult::arrived(distance);
        }

        if !location.has_motion_signal() || self.is_stale(location) {
            return self.historical_average(distance);
        }

        let speed = location.speed_kmh;
        let bearing = spatial::bearing_degrees(origin, anchor);
        let deviation = spatial::heading_deviation(location.heading_deg, bearing);

        if distance <= self.settings.routing_max_distance_meters
            && speed > self.settings.min_speed_kmh
            && deviation <= self.settings.routing_heading_tolerance_deg
        {
            if let Some(routed) = self.try_routing(origin, anchor).await {
                return routed;
            }
        }

        self.project(distance, speed, deviation)
    }

    fn is_stale(&self, location: &VehicleLocation) -> bool {
        let age = Utc::now().signed_duration_since(location.observed_at);
        age.to_std().is_ok_and(|age| age > self.settings.stale_after)
    }

    /// One routing call within budget; `None` means fall back to projection
    async fn try_routing(&self, origin: LatLon, anchor: LatLon) -> Option<EtaResult> {
        let provider = self.routing.as_ref()?;

        if !self.limiter.lock().try_acquire(Instant::now()) {
            debug!("eta_routing_budget_exhausted");
            return None;
        }
        self.metrics.record_routing_call();

        let outcome = tokio::time::timeout(self.settings.routing_timeout, provider.route(origin, anchor))
            .await
            .unwrap_or(Err(RoutingError::Timeout));

        match outcome {
            Ok(route) => Some(EtaResult {
                estimated_arrival_minutes: EtaResult::round_minutes(route.duration_seconds / 60.0),
                distance_meters: route.distance_meters,
                route: Some(route),
                confidence: Confidence::High,
                method: EtaMethod::RoutingApi,
            }),
            Err(RoutingError::RateLimited) => {
                self.limiter.lock().exhaust(Instant::now());
                self.metrics.record_routing_rate_limited();
                warn!("eta_routing_rate_limited");
                None
            }
            Err(e) => {
                self.metrics.record_routing_failure();
                warn!(error = %e, "eta_routing_failed");
                None
            }
        }
    }

    fn project(&self, distance: f64, speed: f64, deviation: f64) -> EtaResult {
        let moving = speed > self.settings.min_speed_kmh;
        let aligned = deviation <= self.settings.routing_heading_tolerance_deg;
        let effective_speed = if moving { speed } else { self.settings.fallback_speed_kmh };

        let mut minutes = distance / 1000.0 / effective_speed * 60.0;
        if !aligned {
            minutes *= MISALIGNED_PENALTY;
        }

        let confidence = if aligned
            && speed > HIGH_CONFIDENCE_SPEED_KMH
            && distance < HIGH_CONFIDENCE_MAX_METERS
        {
            Confidence::High
        } else if !aligned || !moving || distance > LOW_CONFIDENCE_MIN_METERS {
            Confidence::Low
        } else {
            Confidence::Medium
        };

        EtaResult {
            estimated_arrival_minutes: EtaResult::round_minutes(minutes),
            distance_meters: distance,
            route: None,
            confidence,
            method: EtaMethod::GpsProjection,
        }
    }

    fn historical_average(&self, distance: f64) -> EtaResult {
        let minutes = distance / 1000.0 / self.settings.fallback_speed_kmh * 60.0;
        EtaResult {
            estimated_arrival_minutes: EtaResult::round_minutes(minutes),
            distance_meters: distance,
            route: None,
            confidence: Confidence::Medium,
            method: EtaMethod::HistoricalAverage,
        }
    }

    pub fn cache_stats(&self) -> EtaCacheStats {
        let (size, hits, misses) = {
            let cache = self.cache.lock();
            (cache.len(), cache.hits(), cache.misses())
        };
        let now = Instant::now();
        let mut limiter = self.limiter.lock();
        EtaCacheStats {
            size,
            hits,
            misses,
            api_calls_in_window: limiter.in_window(now),
            max_calls_per_minute: limiter.max_per_window(),
            rate_limited: limiter.is_limited(now),
        }
    }

    /// Drop expired cache entries
    pub fn sweep_cache(&self) -> usize {
        self.cache.lock().sweep(Instant::now())
    }
}
