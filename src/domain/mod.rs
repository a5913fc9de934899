//! Domain models - geofences, vehicle positions, estimates and alerts
//!
//! - `Geofence` - named circle or polygon with an alert threshold
//! - `VehicleLocation` - latest observed position of a vehicle
//! - `EtaResult` - arrival estimate with confidence and method
//! - `Alert` - classified alert record

pub mod alert;
pub mod eta;
pub mod geofence;
pub mod types;

pub use alert::{Alert, AlertEvent, AlertMetadata, AlertType, Priority};
pub use eta::{Confidence, EtaMethod, EtaResult, RouteSummary};
pub use geofence::{
    Geofence, GeofenceCategory, GeofenceMetadata, GeofenceShape, GeofenceUpdate, NewGeofence,
};
pub use types::{AlertId, GeofenceId, LatLon, VehicleId, VehicleLocation};
