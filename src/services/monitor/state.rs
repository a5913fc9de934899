//! Per-vehicle monitoring state

use crate::domain::types::{GeofenceId, VehicleLocation};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;

#[derive(Debug)]
pub(crate) struct VehicleState {
    /// Location at the last evaluated check
    pub(crate) last_location: VehicleLocation,
    pub(crate) last_checked_at: Instant,
    /// Last alert per geofence, for cooldown
    pub(crate) last_alert_at: FxHashMap<GeofenceId, Instant>,
    /// Geofences within the nearby radius at the last evaluated check
    pub(crate) nearby: FxHashSet<GeofenceId>,
    /// Geofences with an Entered alert not yet matched by Exited
    pub(crate) outstanding_entries: FxHashSet<GeofenceId>,
}

impl VehicleState {
    pub(crate) fn new(location: VehicleLocation, now: Instant) -> Self {
        Self {
            last_location: location,
            last_checked_at: now,
            last_alert_at: FxHashMap::default(),
            nearby: FxHashSet::default(),
            outstanding_entries: FxHashSet::default(),
        }
    }
}
