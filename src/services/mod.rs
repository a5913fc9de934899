//! Services - business logic and state management
//!
//! - `spatial` - distance, bearing and containment math
//! - `geofence_store` - geofence CRUD over a persistence backend
//! - `eta` - arrival estimates with cache, rate limiting and fallbacks
//! - `monitor` - periodic proximity evaluation per vehicle
//! - `dispatcher` - alert classification, persistence, fan-out and escalation
//! - `subscribers` - real-time feed subscriptions

pub mod dispatcher;
pub mod eta;
pub mod geofence_store;
pub mod monitor;
pub mod spatial;
pub mod subscribers;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use dispatcher::{AlertDispatcher, DispatcherSettings};
pub use eta::{EtaEngine, EtaSettings};
pub use geofence_store::GeofenceStore;
pub use monitor::{MonitorSettings, ProximityMonitor};
pub use subscribers::SubscriberRegistry;
