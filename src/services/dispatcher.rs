//! Alert classification, persistence and fan-out

use crate::domain::alert::{Alert, AlertEvent, AlertMetadata, AlertType, Priority};
use crate::domain::eta::EtaResult;
use crate::domain::types::{AlertId, GeofenceId, VehicleId};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::alert_store::AlertPersistence;
use crate::io::escalation::EscalationChannel;
use crate::services::subscribers::{Acknowledgement, EtaUpdate, FeedEvent, SubscriberRegistry};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Minutes behind schedule above which an alert is high priority
const HIGH_DELAY_MINUTES: f64 = 15.0;
const MEDIUM_DELAY_MINUTES: f64 = 5.0;
/// Approaching alerts this close are at least medium priority
const IMMINENT_ETA_MINUTES: u32 = 2;

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Retention in the durable store
    pub alert_ttl: Duration,
    /// How long an acknowledged alert stays visible
    pub ack_grace: Duration,
    /// Age after which an alert leaves the active index
    pub max_age: Duration,
    pub prune_interval: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            alert_ttl: Duration::from_secs(24 * 3600),
            ack_grace: Duration::from_secs(30),
            max_age: Duration::from_secs(2 * 3600),
            prune_interval: Duration::from_secs(15 * 60),
        }
    }
}

impl DispatcherSettings {
    pub fn from_config(config: &Config) -> Self {
        let alerts = config.alerts();
        Self {
            alert_ttl: Duration::from_secs(alerts.ttl_hours * 3600),
            ack_grace: Duration::from_secs(alerts.ack_grace_secs),
            max_age: Duration::from_secs(alerts.max_age_secs),
            prune_interval: Duration::from_secs(alerts.prune_interval_secs.max(1)),
        }
    }
}

struct ActiveAlert {
    alert: Alert,
    inserted_at: Instant,
    acknowledged_at: Option<Instant>,
}

impl ActiveAlert {
    fn expired(&self, now: Instant, settings: &DispatcherSettings) -> bool {
        now.duration_since(self.inserted_at) >= settings.max_age
            || self.acknowledged_at.is_some_and(|at| now.duration_since(at) >= settings.ack_grace)
    }
}

/// Minutes the vehicle will arrive after its scheduled time, if known
fn projected_delay_minutes(event: &AlertEvent, now: DateTime<Utc>) -> Option<f64> {
    let scheduled = event.geofence.metadata.scheduled_arrival?;
    let eta = event.eta.as_ref()?;
    let projected = now + chrono::Duration::minutes(i64::from(eta.estimated_arrival_minutes));
    Some(projected.signed_duration_since(scheduled).num_seconds() as f64 / 60.0)
}

pub fn classify(event: &AlertEvent, now: DateTime<Utc>) -> Priority {
    let delay = projected_delay_minutes(event, now);
    let restricted_entry =
        event.alert_type == AlertType::Entered && event.geofence.is_restricted();

    if restricted_entry || delay.is_some_and(|d| d > HIGH_DELAY_MINUTES) {
        return Priority::High;
    }

    let imminent = event.alert_type == AlertType::Approaching
        && event.eta.as_ref().is_some_and(|eta| eta.estimated_arrival_minutes <= IMMINENT_ETA_MINUTES);
    if delay.is_some_and(|d| d > MEDIUM_DELAY_MINUTES) || imminent {
        Priority::Medium
    } else {
        Priority::Low
    }
}

pub struct AlertDispatcher {
    settings: DispatcherSettings,
    persistence: Arc<dyn AlertPersistence>,
    registry: Arc<SubscriberRegistry>,
    escalation: Arc<dyn EscalationChannel>,
    metrics: Arc<Metrics>,
    active: RwLock<FxHashMap<AlertId, ActiveAlert>>,
}

impl AlertDispatcher {
    pub fn new(
        settings: DispatcherSettings,
        persistence: Arc<dyn AlertPersistence>,
        registry: Arc<SubscriberRegistry>,
        escalation: Arc<dyn EscalationChannel>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            settings,
            persistence,
            registry,
            escalation,
            metrics,
            active: RwLock::new(FxHashMap::default()),
        }
    }

    pub async fn send_alert(&self, event: AlertEvent) -> Alert {
        let now = Utc::now();
        let priority = classify(&event, now);
        let geofence = event.geofence;
        let alert = Alert {
            id: AlertId::generate(),
            vehicle_id: event.vehicle_id,
            geofence_id: geofence.id.clone(),
            geofence_name: geofence.name.clone(),
            alert_type: event.alert_type,
            eta: event.eta,
            priority,
            created_at: now,
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            metadata: AlertMetadata {
                route_id: geofence.metadata.route_id.clone(),
                stop_id: geofence.metadata.stop_id.clone(),
                scheduled_arrival: geofence.metadata.scheduled_arrival,
            },
        };

        if let Err(e) = self.persistence.put(&alert, self.settings.alert_ttl).await {
            self.metrics.record_alert_persist_failure();
            error!(alert_id = %alert.id, error = %e, "alert_persist_failed");
        }

        self.active.write().insert(
            alert.id.clone(),
            ActiveAlert { alert: alert.clone(), inserted_at: Instant::now(), acknowledged_at: None },
        );
        self.metrics.record_alert(alert.alert_type, alert.priority);

        let delivered = self.registry.broadcast(FeedEvent::GeofenceAlert(alert.clone()));
        info!(
            alert_id = %alert.id,
            vehicle_id = %alert.vehicle_id,
            geofence_id = %alert.geofence_id,
            alert_type = %alert.alert_type,
            priority = %alert.priority.as_str(),
            subscribers = %delivered,
            "alert_sent"
        );

        if alert.priority == Priority::High {
            self.escalate(&alert).await;
        }
        alert
    }

    async fn escalate(&self, alert: &Alert) {
        let subject = format!("High Priority Alert: {} - {}", alert.alert_type, alert.geofence_name);
        let payload = json!({
            "alertId": alert.id,
            "vehicleId": alert.vehicle_id,
            "geofenceName": alert.geofence_name,
            "alertType": alert.alert_type,
            "timestamp": alert.created_at,
            "eta": alert.eta,
        })
        .to_string();

        match self.escalation.publish(&subject, &payload).await {
            Ok(()) => {
                self.metrics.record_escalation(true);
                debug!(alert_id = %alert.id, "alert_escalated");
            }
            Err(e) => {
                self.metrics.record_escalation(false);
                warn!(alert_id = %alert.id, error = %e, "alert_escalation_failed");
            }
        }
    }

    pub fn send_eta_update(&self, vehicle_id: &VehicleId, geofence_id: &GeofenceId, eta: &EtaResult) {
        self.registry.broadcast(FeedEvent::EtaUpdate(EtaUpdate {
            vehicle_id: vehicle_id.clone(),
            geofence_id: geofence_id.clone(),
            eta: eta.clone(),
        }));
    }

    /// Acknowledge an active alert; `false` if it is unknown or already pruned.
    ///
    /// Acknowledging twice keeps the first acknowledgement.
    pub async fn acknowledge_alert(&self, id: &AlertId, user_id: &str) -> bool {
        let now = Utc::now();
        let acknowledged = {
            let mut active = self.active.write();
            match active.get_mut(id) {
                None => return false,
                Some(entry) if entry.alert.acknowledged => None,
                Some(entry) => {
                    entry.alert.acknowledge(user_id, now);
                    entry.acknowledged_at = Some(Instant::now());
                    Some(entry.alert.geofence_id.clone())
                }
            }
        };
        let Some(geofence_id) = acknowledged else {
            return true;
        };

        self.metrics.record_alert_acknowledged();
        if let Err(e) = self.persistence.update_acknowledged(id, user_id, now).await {
            self.metrics.record_alert_persist_failure();
            error!(alert_id = %id, error = %e, "alert_ack_persist_failed");
        }

        self.registry.broadcast(FeedEvent::AlertAcknowledged(Acknowledgement {
            alert_id: id.clone(),
            acknowledged_by: user_id.to_string(),
            geofence_id,
        }));
        info!(alert_id = %id, user_id = %user_id, "alert_acknowledged");
        true
    }

    /// Alerts currently visible, newest first
    pub fn active_alerts(&self) -> Vec<Alert> {
        let now = Instant::now();
        let mut alerts: Vec<Alert> = self
            .active
            .read()
            .values()
            .filter(|entry| !entry.expired(now, &self.settings))
            .map(|entry| entry.alert.clone())
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        alerts
    }

    /// Drop aged-out and acknowledged-past-grace alerts; returns how many went
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut active = self.active.write();
        let before = active.len();
        active.retain(|_, entry| !entry.expired(now, &self.settings));
        let removed = before - active.len();
        if removed > 0 {
            debug!(removed = %removed, remaining = %active.len(), "alerts_pruned");
        }
        removed
    }

    /// Drop TTL-expired alerts from the durable store
    pub async fn purge_store(&self) -> usize {
        match self.persistence.purge_expired(Utc::now()).await {
            Ok(purged) => {
                if purged > 0 {
                    debug!(purged = %purged, "alert_store_purged");
                }
                purged
            }
            Err(e) => {
                self.metrics.record_alert_persist_failure();
                warn!(error = %e, "alert_store_purge_failed");
                0
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    pub async fn run_pruner(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.prune_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("alert_pruner_shutdown");
                        return;
                    }
                }
                _ = interval.tick() => {
                    self.prune();
                    self.purge_store().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::eta::{Confidence, EtaMethod};
    use crate::domain::geofence::{Geofence, GeofenceCategory, GeofenceMetadata, GeofenceShape};
    use crate::domain::types::LatLon;
    use crate::io::alert_store::InMemoryAlertStore;
    use crate::services::subscribers::ServerMessage;
    use crate::services::test_support::RecordingEscalation;

    struct Harness {
        dispatcher: AlertDispatcher,
        store: Arc<InMemoryAlertStore>,
        registry: Arc<SubscriberRegistry>,
        escalation: Arc<RecordingEscalation>,
        metrics: Arc<Metrics>,
    }

    fn harness() -> Harness {
        harness_with(DispatcherSettings::default())
    }

    fn harness_with(settings: DispatcherSettings) -> Harness {
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(InMemoryAlertStore::new());
        let registry = Arc::new(SubscriberRegistry::new(16, metrics.clone()));
        let escalation = Arc::new(RecordingEscalation::default());
        let dispatcher = AlertDispatcher::new(
            settings,
            store.clone(),
            registry.clone(),
            escalation.clone(),
            metrics.clone(),
        );
        Harness { dispatcher, store, registry, escalation, metrics }
    }

    fn geofence(category: Option<GeofenceCategory>) -> Geofence {
        Geofence {
            id: GeofenceId::from("gf-1"),
            name: "Main St".to_string(),
            description: None,
            shape: GeofenceShape::Circle { center: LatLon::new(43.0, -80.0), radius_meters: 30.0 },
            alert_threshold_minutes: 5,
            active: true,
            category,
            metadata: GeofenceMetadata::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn eta(minutes: u32) -> EtaResult {
        EtaResult {
            estimated_arrival_minutes: minutes,
            distance_meters: 1000.0,
            route: None,
            confidence: Confidence::Medium,
            method: EtaMethod::GpsProjection,
        }
    }

    fn event(geofence: Geofence, alert_type: AlertType, eta: Option<EtaResult>) -> AlertEvent {
        AlertEvent { vehicle_id: VehicleId::from("bus-001"), geofence, alert_type, eta }
    }

    #[test]
    fn test_classify_restricted_entry_is_high() {
        let now = Utc::now();
        let restricted = geofence(Some(GeofenceCategory::Restricted));
        assert_eq!(classify(&event(restricted.clone(), AlertType::Entered, None), now), Priority::High);
        assert_eq!(classify(&event(restricted, AlertType::Exited, None), now), Priority::Low);
        let depot = geofence(Some(GeofenceCategory::Depot));
        assert_eq!(classify(&event(depot, AlertType::Entered, None), now), Priority::Low);
    }

    #[test]
    fn test_classify_by_schedule_delay() {
        let now = Utc::now();
        let mut late = geofence(None);
        late.metadata.scheduled_arrival = Some(now - chrono::Duration::minutes(10));
        // 10 behind + 6 more minutes = 16 late
        assert_eq!(classify(&event(late.clone(), AlertType::Approaching, Some(eta(6))), now), Priority::High);
        // 10 behind + 3 = 13 late
        assert_eq!(
            classify(&event(late.clone(), AlertType::Approaching, Some(eta(3))), now),
            Priority::Medium
        );

        let mut on_time = geofence(None);
        on_time.metadata.scheduled_arrival = Some(now + chrono::Duration::minutes(10));
        assert_eq!(classify(&event(on_time, AlertType::Approaching, Some(eta(4))), now), Priority::Low);

        // No eta, no delay
        assert_eq!(classify(&event(late, AlertType::Entered, None), now), Priority::Low);
    }

    #[test]
    fn test_classify_imminent_approach_is_medium() {
        let now = Utc::now();
        assert_eq!(
            classify(&event(geofence(None), AlertType::Approaching, Some(eta(2))), now),
            Priority::Medium
        );
        assert_eq!(
            classify(&event(geofence(None), AlertType::Approaching, Some(eta(3))), now),
            Priority::Low
        );
    }

    #[tokio::test]
    async fn test_send_alert_persists_indexes_and_broadcasts() {
        let h = harness();
        let (_id, mut rx) = h.registry.register();

        let mut gf = geofence(None);
        gf.metadata.stop_id = Some("stop-42".to_string());
        let alert = h.dispatcher.send_alert(event(gf, AlertType::Entered, None)).await;

        assert!(h.store.get(&alert.id).is_some());
        assert_eq!(h.dispatcher.active_alerts(), vec![alert.clone()]);
        assert_eq!(alert.metadata.stop_id.as_deref(), Some("stop-42"));
        match &*rx.recv().await.unwrap() {
            ServerMessage::GeofenceAlert { data, .. } => assert_eq!(data.id, alert.id),
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.escalation.published.lock().is_empty());
        assert_eq!(h.metrics.counters().alerts_entered_total, 1);
    }

    #[tokio::test]
    async fn test_high_priority_alert_is_escalated() {
        let h = harness();
        let alert = h
            .dispatcher
            .send_alert(event(geofence(Some(GeofenceCategory::Restricted)), AlertType::Entered, None))
            .await;
        assert_eq!(alert.priority, Priority::High);

        let published = h.escalation.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "High Priority Alert: entered - Main St");
        let payload: serde_json::Value = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(payload["alertId"], alert.id.0.as_str());
        assert_eq!(payload["geofenceName"], "Main St");
        assert_eq!(payload["alertType"], "entered");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledged_alert_visible_through_grace() {
        let h = harness();
        let alert = h.dispatcher.send_alert(event(geofence(None), AlertType::Entered, None)).await;
        let (_id, mut rx) = h.registry.register();

        assert!(h.dispatcher.acknowledge_alert(&alert.id, "op-7").await);
        match &*rx.recv().await.unwrap() {
            ServerMessage::AlertAcknowledged { data, .. } => {
                assert_eq!(data.alert_id, alert.id);
                assert_eq!(data.acknowledged_by, "op-7");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.store.get(&alert.id).unwrap().acknowledged);

        tokio::time::advance(Duration::from_secs(29)).await;
        let visible = h.dispatcher.active_alerts();
        assert_eq!(visible.len(), 1);
        assert!(visible[0].acknowledged);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(h.dispatcher.active_alerts().is_empty());
        assert_eq!(h.dispatcher.prune(), 1);
        assert_eq!(h.dispatcher.active_count(), 0);
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_and_repeat() {
        let h = harness();
        assert!(!h.dispatcher.acknowledge_alert(&AlertId::from("alert-missing"), "op").await);

        let alert = h.dispatcher.send_alert(event(geofence(None), AlertType::Entered, None)).await;
        assert!(h.dispatcher.acknowledge_alert(&alert.id, "first").await);
        assert!(h.dispatcher.acknowledge_alert(&alert.id, "second").await);
        let visible = h.dispatcher.active_alerts();
        assert_eq!(visible[0].acknowledged_by.as_deref(), Some("first"));
        assert_eq!(h.metrics.counters().alerts_acknowledged_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_drops_alerts_past_max_age() {
        let h = harness();
        h.dispatcher.send_alert(event(geofence(None), AlertType::Entered, None)).await;
        tokio::time::advance(Duration::from_secs(3600)).await;
        let newer = h.dispatcher.send_alert(event(geofence(None), AlertType::Exited, None)).await;

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(h.dispatcher.prune(), 1);
        let remaining = h.dispatcher.active_alerts();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, newer.id);
    }

    #[tokio::test]
    async fn test_purge_store_drops_expired_alerts() {
        let h = harness_with(DispatcherSettings { alert_ttl: Duration::ZERO, ..Default::default() });
        h.dispatcher.send_alert(event(geofence(None), AlertType::Entered, None)).await;
        assert_eq!(h.store.len(), 1);

        assert_eq!(h.dispatcher.purge_store().await, 1);
        assert!(h.store.is_empty());
        // The in-process index keeps its own retention
        assert_eq!(h.dispatcher.active_count(), 1);
    }

    #[tokio::test]
    async fn test_active_alerts_newest_first() {
        let h = harness();
        let first = h.dispatcher.send_alert(event(geofence(None), AlertType::Entered, None)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = h.dispatcher.send_alert(event(geofence(None), AlertType::Exited, None)).await;
        let ids: Vec<AlertId> = h.dispatcher.active_alerts().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }
}
