//! Shared fixtures for service tests

use crate::domain::eta::RouteSummary;
use crate::domain::geofence::{Geofence, GeofenceCategory, GeofenceMetadata, GeofenceShape, NewGeofence};
use crate::domain::types::{GeofenceId, LatLon, VehicleLocation};
use crate::error::{EscalationError, RoutingError};
use crate::infra::metrics::Metrics;
use crate::io::alert_store::InMemoryAlertStore;
use crate::io::escalation::EscalationChannel;
use crate::io::geofence_persistence::InMemoryGeofences;
use crate::io::location_store::InMemoryLocationStore;
use crate::io::routing::RoutingProvider;
use crate::services::dispatcher::{AlertDispatcher, DispatcherSettings};
use crate::services::eta::{EtaEngine, EtaSettings};
use crate::services::geofence_store::GeofenceStore;
use crate::services::spatial::EARTH_RADIUS_METERS;
use crate::services::subscribers::SubscriberRegistry;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const ANCHOR: LatLon = LatLon::new(43.4723, -80.5449);

/// Point `meters` due south of `anchor`; a vehicle there heading 0 drives straight at it
pub fn south_of(anchor: LatLon, meters: f64) -> LatLon {
    let meters_per_degree = EARTH_RADIUS_METERS * std::f64::consts::PI / 180.0;
    LatLon::new(anchor.lat - meters / meters_per_degree, anchor.lon)
}

pub fn location(vehicle: &str, position: LatLon, speed_kmh: f64, heading_deg: f64) -> VehicleLocation {
    VehicleLocation::new(vehicle, position, speed_kmh, heading_deg)
}

pub fn new_circle(id: &str, radius_meters: f64, threshold_minutes: u32) -> NewGeofence {
    NewGeofence {
        id: Some(GeofenceId::from(id)),
        name: format!("Stop {id}"),
        description: None,
        shape: GeofenceShape::Circle { center: ANCHOR, radius_meters },
        alert_threshold_minutes: threshold_minutes,
        active: true,
        category: Some(GeofenceCategory::BusStop),
        metadata: GeofenceMetadata::default(),
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RouterBehavior {
    Route { seconds: f64, meters: f64 },
    RateLimited,
    Fail,
    /// Never answers
    Hang,
}

pub struct CountingRouter {
    behavior: Mutex<RouterBehavior>,
    calls: AtomicUsize,
}

impl CountingRouter {
    pub fn new(behavior: RouterBehavior) -> Arc<Self> {
        Arc::new(Self { behavior: Mutex::new(behavior), calls: AtomicUsize::new(0) })
    }

    pub fn set(&self, behavior: RouterBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoutingProvider for CountingRouter {
    async fn route(&self, _from: LatLon, _to: LatLon) -> Result<RouteSummary, RoutingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.behavior.lock();
        match behavior {
            RouterBehavior::Route { seconds, meters } => {
                Ok(RouteSummary { duration_seconds: seconds, distance_meters: meters })
            }
            RouterBehavior::RateLimited => Err(RoutingError::RateLimited),
            RouterBehavior::Fail => Err(RoutingError::Http("status 500".to_string())),
            RouterBehavior::Hang => std::future::pending().await,
        }
    }
}

#[derive(Default)]
pub struct RecordingEscalation {
    pub published: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl EscalationChannel for RecordingEscalation {
    async fn publish(&self, subject: &str, payload: &str) -> Result<(), EscalationError> {
        self.published.lock().push((subject.to_string(), payload.to_string()));
        Ok(())
    }
}

/// In-memory wiring of every collaborator a service needs
pub struct Fixture {
    pub locations: Arc<InMemoryLocationStore>,
    pub geofences: Arc<GeofenceStore>,
    pub metrics: Arc<Metrics>,
    pub registry: Arc<SubscriberRegistry>,
    pub alerts: Arc<InMemoryAlertStore>,
    pub escalation: Arc<RecordingEscalation>,
}

impl Fixture {
    pub fn new() -> Self {
        let metrics = Arc::new(Metrics::new());
        Self {
            locations: Arc::new(InMemoryLocationStore::new()),
            geofences: Arc::new(GeofenceStore::new(Arc::new(InMemoryGeofences::new()))),
            registry: Arc::new(SubscriberRegistry::new(64, metrics.clone())),
            metrics,
            alerts: Arc::new(InMemoryAlertStore::new()),
            escalation: Arc::new(RecordingEscalation::default()),
        }
    }

    pub async fn add(&self, new: NewGeofence) -> Geofence {
        self.geofences.create(new).await.unwrap()
    }

    pub fn engine(&self, settings: EtaSettings, router: Option<Arc<CountingRouter>>) -> Arc<EtaEngine> {
        let routing = router.map(|r| r as Arc<dyn RoutingProvider>);
        Arc::new(EtaEngine::new(
            settings,
            self.locations.clone(),
            self.geofences.clone(),
            routing,
            self.metrics.clone(),
        ))
    }

    pub fn dispatcher(&self) -> Arc<AlertDispatcher> {
        Arc::new(AlertDispatcher::new(
            DispatcherSettings::default(),
            self.alerts.clone(),
            self.registry.clone(),
            self.escalation.clone(),
            self.metrics.clone(),
        ))
    }
}
