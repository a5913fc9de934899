//! Proximity monitoring loop
//!
//! Every tick the monitor takes the vehicles seen recently and the active
//! geofence set, and for each vehicle:
//! - throttles vehicles checked too recently or barely moving
//! - narrows the geofence set to those within the nearby radius
//! - emits Entered / Exited / Approaching alerts, subject to a per-pair cooldown
//!
//! Exited bypasses the cooldown: it closes an outstanding Entered, so a
//! cooldown window holds at most one Entered/Exited pair for a given
//! vehicle and geofence.
//!
//! Vehicles are evaluated in fixed-size batches; vehicles inside a batch run
//! as separate tasks so one failure cannot take down the rest.

mod state;

use crate::domain::alert::{AlertEvent, AlertType};
use crate::domain::eta::EtaResult;
use crate::domain::geofence::Geofence;
use crate::domain::types::{VehicleId, VehicleLocation};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::location_store::LocationStore;
use crate::services::dispatcher::AlertDispatcher;
use crate::services::eta::EtaEngine;
use crate::services::geofence_store::GeofenceStore;
use crate::services::spatial;
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use state::VehicleState;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub check_interval: Duration,
    pub cooldown: Duration,
    pub min_movement_meters: f64,
    pub slow_speed_kmh: f64,
    pub nearby_radius_meters: f64,
    pub batch_size: usize,
    /// Maximum heading deviation for an Approaching alert
    pub heading_tolerance_deg: f64,
    /// ETA is only requested within this multiple of the alert distance budget
    pub eta_budget_factor: f64,
    pub state_ttl: Duration,
    pub report_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            cooldown: Duration::from_secs(300),
            min_movement_meters: 50.0,
            slow_speed_kmh: 5.0,
            nearby_radius_meters: 10_000.0,
            batch_size: 10,
            heading_tolerance_deg: 60.0,
            eta_budget_factor: 1.5,
            state_ttl: Duration::from_secs(3600),
            report_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        let monitor = config.monitor();
        Self {
            check_interval: Duration::from_secs(monitor.check_interval_secs.max(1)),
            cooldown: Duration::from_secs(monitor.cooldown_secs),
            min_movement_meters: monitor.min_movement_meters,
            slow_speed_kmh: monitor.slow_speed_kmh,
            nearby_radius_meters: monitor.nearby_radius_meters,
            batch_size: monitor.batch_size.max(1),
            heading_tolerance_deg: monitor.heading_tolerance_deg,
            eta_budget_factor: monitor.eta_budget_factor,
            state_ttl: Duration::from_secs(monitor.state_ttl_secs),
            report_interval: Duration::from_secs(config.metrics_interval_secs().max(1)),
            shutdown_grace: Duration::from_secs(monitor.shutdown_grace_secs),
        }
    }
}

/// Outcome of one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub processed: usize,
    pub skipped: usize,
    pub alerts: usize,
    pub errors: usize,
}

pub struct ProximityMonitor {
    settings: MonitorSettings,
    locations: Arc<dyn LocationStore>,
    geofences: Arc<GeofenceStore>,
    engine: Arc<EtaEngine>,
    dispatcher: Arc<AlertDispatcher>,
    metrics: Arc<Metrics>,
    states: Mutex<FxHashMap<VehicleId, VehicleState>>,
}

impl ProximityMonitor {
    pub fn new(
        settings: MonitorSettings,
        locations: Arc<dyn LocationStore>,
        geofences: Arc<GeofenceStore>,
        engine: Arc<EtaEngine>,
        dispatcher: Arc<AlertDispatcher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            settings,
            locations,
            geofences,
            engine,
            dispatcher,
            metrics,
            states: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn tracked_vehicles(&self) -> usize {
        self.states.lock().len()
    }

    /// Throttle decision, recording the check when it passes.
    ///
    /// The first observation of a vehicle always passes.
    fn should_check(&self, location: &VehicleLocation, now: Instant) -> bool {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(&location.vehicle_id) else {
            states.insert(location.vehicle_id.clone(), VehicleState::new(location.clone(), now));
            return true;
        };

        if now.saturating_duration_since(state.last_checked_at) < self.settings.check_interval {
            return false;
        }
        let moved = spatial::distance_meters(state.last_location.position(), location.position());
        if moved < self.settings.min_movement_meters && location.speed_kmh < self.settings.slow_speed_kmh
        {
            return false;
        }

        state.last_location = location.clone();
        state.last_checked_at = now;
        true
    }

    /// Evaluate one batch of vehicles against the geofence set
    pub async fn process_tick(
        self: &Arc<Self>,
        locations: Vec<VehicleLocation>,
        geofences: Arc<[Geofence]>,
        now: Instant,
    ) -> TickSummary {
        let started = Instant::now();
        let mut summary = TickSummary::default();

        for batch in locations.chunks(self.settings.batch_size) {
            let mut handles = Vec::with_capacity(batch.len());
            for location in batch {
                if !self.should_check(location, now) {
                    summary.skipped += 1;
                    self.metrics.record_vehicle_skipped();
                    continue;
                }
                let monitor = Arc::clone(self);
                let geofences = Arc::clone(&geofences);
                let location = location.clone();
                let vehicle_id = location.vehicle_id.clone();
                let handle = tokio::spawn(async move {
                    monitor.evaluate_vehicle(&location, &geofences, now).await
                });
                handles.push((vehicle_id, handle));
            }

            let (ids, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
            for (vehicle_id, joined) in ids.into_iter().zip(join_all(handles).await) {
                match joined {
                    Ok(alerts) => {
                        summary.processed += 1;
                        summary.alerts += alerts;
                        self.metrics.record_vehicle_processed();
                    }
                    Err(e) => {
                        summary.errors += 1;
                        self.metrics.record_vehicle_error();
                        error!(vehicle_id = %vehicle_id, error = %e, "vehicle_evaluation_failed");
                    }
                }
            }
        }

        self.metrics.record_tick(started.elapsed().as_millis() as u64);
        debug!(
            processed = %summary.processed,
            skipped = %summary.skipped,
            alerts = %summary.alerts,
            "monitor_tick_completed"
        );
        summary
    }

    /// Returns how many alerts were emitted for the vehicle
    async fn evaluate_vehicle(
        &self,
        location: &VehicleLocation,
        geofences: &[Geofence],
        now: Instant,
    ) -> usize {
        let position = location.position();
        let mut alerts = self.emit_exits(location, geofences).await;

        let mut nearby: SmallVec<[(f64, &Geofence); 8]> = geofences
            .iter()
            .filter_map(|geofence| {
                let distance = spatial::distance_meters(position, geofence.anchor());
                let edge = distance - spatial::reach_meters(&geofence.shape);
                (edge <= self.settings.nearby_radius_meters).then_some((distance, geofence))
            })
            .collect();
        nearby.sort_by(|a, b| a.0.total_cmp(&b.0));
        self.with_state(&location.vehicle_id, |state| {
            state.nearby = nearby.iter().map(|(_, geofence)| geofence.id.clone()).collect();
        });

        for (distance, geofence) in nearby {
            if self.in_cooldown(&location.vehicle_id, geofence, now) {
                continue;
            }

            if spatial::contains(geofence, position) {
                self.with_state(&location.vehicle_id, |state| {
                    state.last_alert_at.insert(geofence.id.clone(), now);
                    state.outstanding_entries.insert(geofence.id.clone());
                });
                self.send(location, geofence, AlertType::Entered, None).await;
                alerts += 1;
                continue;
            }

            let budget_meters =
                f64::from(geofence.alert_threshold_minutes) * location.speed_kmh * 1000.0 / 60.0;
            let within_budget = distance <= self.settings.eta_budget_factor * budget_meters;
            if !within_budget {
                continue;
            }

            let eta = self.engine.estimate(location, geofence).await;
            self.dispatcher.send_eta_update(&location.vehicle_id, &geofence.id, &eta);

            let bearing = spatial::bearing_degrees(position, geofence.anchor());
            let deviation = spatial::heading_deviation(location.heading_deg, bearing);
            if eta.estimated_arrival_minutes <= geofence.alert_threshold_minutes
                && deviation <= self.settings.heading_tolerance_deg
            {
                self.with_state(&location.vehicle_id, |state| {
                    state.last_alert_at.insert(geofence.id.clone(), now);
                });
                self.send(location, geofence, AlertType::Approaching, Some(eta)).await;
                alerts += 1;
            }
        }

        debug!(vehicle_id = %location.vehicle_id, alerts = %alerts, "vehicle_evaluated");
        alerts
    }

    /// Exited alerts for outstanding entries the vehicle has left; these
    /// ignore the cooldown
    async fn emit_exits(&self, location: &VehicleLocation, geofences: &[Geofence]) -> usize {
        let position = location.position();
        let outstanding: Vec<_> = self
            .with_state(&location.vehicle_id, |state| {
                state.outstanding_entries.iter().cloned().collect()
            })
            .unwrap_or_default();

        let mut exits = 0;
        for geofence_id in outstanding {
            match geofences.iter().find(|g| g.id == geofence_id) {
                Some(geofence) if spatial::contains(geofence, position) => {}
                Some(geofence) => {
                    self.with_state(&location.vehicle_id, |state| {
                        state.outstanding_entries.remove(&geofence_id);
                    });
                    self.send(location, geofence, AlertType::Exited, None).await;
                    exits += 1;
                }
                // Geofence deactivated while the vehicle was inside
                None => {
                    self.with_state(&location.vehicle_id, |state| {
                        state.outstanding_entries.remove(&geofence_id);
                    });
                }
            }
        }
        exits
    }

    fn in_cooldown(&self, vehicle_id: &VehicleId, geofence: &Geofence, now: Instant) -> bool {
        self.with_state(vehicle_id, |state| {
            state
                .last_alert_at
                .get(&geofence.id)
                .is_some_and(|&at| now.saturating_duration_since(at) < self.settings.cooldown)
        })
        .unwrap_or(false)
    }

    fn with_state<R>(&self, vehicle_id: &VehicleId, f: impl FnOnce(&mut VehicleState) -> R) -> Option<R> {
        self.states.lock().get_mut(vehicle_id).map(f)
    }

    async fn send(
        &self,
        location: &VehicleLocation,
        geofence: &Geofence,
        alert_type: AlertType,
        eta: Option<EtaResult>,
    ) {
        let event = AlertEvent {
            vehicle_id: location.vehicle_id.clone(),
            geofence: geofence.clone(),
            alert_type,
            eta,
        };
        self.dispatcher.send_alert(event).await;
    }

    /// Drop vehicles not checked within the state TTL
    pub fn sweep_states(&self, now: Instant) -> usize {
        let ttl = self.settings.state_ttl;
        let mut states = self.states.lock();
        let before = states.len();
        states.retain(|_, state| now.saturating_duration_since(state.last_checked_at) < ttl);
        let removed = before - states.len();
        if removed > 0 {
            info!(removed = %removed, remaining = %states.len(), "vehicle_states_swept");
        }
        removed
    }

    /// Fetch recent vehicles and active geofences, then evaluate them
    pub async fn tick(self: &Arc<Self>, now: Instant) -> Option<TickSummary> {
        let lookback = chrono::Duration::from_std(self.settings.check_interval * 2)
            .unwrap_or_else(|_| chrono::Duration::minutes(1));
        let since = Utc::now() - lookback;

        let locations = match self.locations.recent(since).await {
            Ok(locations) => locations,
            Err(e) => {
                warn!(error = %e, "monitor_locations_fetch_failed");
                return None;
            }
        };
        let geofences: Arc<[Geofence]> = match self.geofences.list().await {
            Ok(geofences) => geofences.into(),
            Err(e) => {
                warn!(error = %e, "monitor_geofences_fetch_failed");
                return None;
            }
        };
        if locations.is_empty() || geofences.is_empty() {
            return Some(TickSummary::default());
        }

        Some(self.process_tick(locations, geofences, now).await)
    }

    /// Log the interval summary and reset periodic counters
    pub fn report(&self) {
        self.metrics.report(self.tracked_vehicles()).log();
        let stats = self.engine.cache_stats();
        info!(
            cache_size = %stats.size,
            cache_hits = %stats.hits,
            cache_misses = %stats.misses,
            api_calls = %stats.api_calls_in_window,
            api_limit = %stats.max_calls_per_minute,
            rate_limited = %stats.rate_limited,
            "eta_cache_stats"
        );
    }

    /// Run ticks until shutdown; an in-flight tick gets `shutdown_grace` to finish
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reporter = interval(self.settings.report_interval);
        reporter.tick().await;

        info!(
            interval_secs = %self.settings.check_interval.as_secs(),
            batch_size = %self.settings.batch_size,
            "monitor_started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("monitor_shutdown");
                        return;
                    }
                }
                at = ticker.tick() => {
                    let tick = self.tick(at);
                    tokio::pin!(tick);
                    tokio::select! {
                        _ = &mut tick => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                if tokio::time::timeout(self.settings.shutdown_grace, &mut tick).await.is_err() {
                                    warn!("monitor_tick_abandoned");
                                }
                                info!("monitor_shutdown");
                                return;
                            }
                            tick.await;
                        }
                    }
                }
                _ = reporter.tick() => {
                    self.report();
                    self.sweep_states(Instant::now());
                    self.engine.sweep_cache();
                }
            }
        }
    }
}
