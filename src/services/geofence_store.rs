//! Geofence CRUD over a pluggable persistence backend
//!
//! Reads go straight to the backend and run concurrently. Every
//! read-modify-write goes through `write_lock` so two updates to the same
//! record cannot interleave.

use crate::domain::geofence::{Geofence, GeofenceUpdate, NewGeofence};
use crate::domain::types::GeofenceId;
use crate::error::GeofenceError;
use crate::io::geofence_persistence::GeofencePersistence;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct GeofenceStore {
    backend: Arc<dyn GeofencePersistence>,
    write_lock: Mutex<()>,
}

impl GeofenceStore {
    pub fn new(backend: Arc<dyn GeofencePersistence>) -> Self {
        Self { backend, write_lock: Mutex::new(()) }
    }

    /// All active geofences
    pub async fn list(&self) -> Result<Vec<Geofence>, GeofenceError> {
        let mut all = self.backend.list().await?;
        all.retain(|g| g.active);
        Ok(all)
    }

    /// Inactive (soft-deleted) geofences are reported as not found
    pub async fn get(&self, id: &GeofenceId) -> Result<Geofence, GeofenceError> {
        match self.backend.get(id).await? {
            Some(geofence) if geofence.active => Ok(geofence),
            _ => Err(GeofenceError::NotFound(id.clone())),
        }
    }

    /// Caller-supplied ids must not collide with a stored record, active or not
    pub async fn create(&self, new: NewGeofence) -> Result<Geofence, GeofenceError> {
        let geofence = new.into_geofence(Utc::now());
        geofence.validate()?;

        let _guard = self.write_lock.lock().await;
        if self.backend.get(&geofence.id).await?.is_some() {
            return Err(GeofenceError::AlreadyExists(geofence.id));
        }
        self.backend.put(&geofence).await?;
        info!(geofence_id = %geofence.id, name = %geofence.name, "geofence_created");
        Ok(geofence)
    }

    pub async fn update(
        &self,
        id: &GeofenceId,
        update: GeofenceUpdate,
    ) -> Result<Geofence, GeofenceError> {
        let _guard = self.write_lock.lock().await;

        let mut geofence =
            self.backend.get(id).await?.ok_or_else(|| GeofenceError::NotFound(id.clone()))?;
        update.apply(&mut geofence, Utc::now());
        geofence.validate()?;

        self.backend.put(&geofence).await?;
        info!(geofence_id = %geofence.id, active = %geofence.active, "geofence_updated");
        Ok(geofence)
    }

    pub async fn soft_delete(&self, id: &GeofenceId) -> Result<(), GeofenceError> {
        let _guard = self.write_lock.lock().await;
        if self.backend.soft_delete(id).await? {
            info!(geofence_id = %id, "geofence_deleted");
            Ok(())
        } else {
            Err(GeofenceError::NotFound(id.clone()))
        }
    }

    /// Insert configured geofences whose id is not already stored.
    ///
    /// Invalid seeds are skipped with a warning; returns how many were added.
    pub async fn seed(&self, seeds: &[NewGeofence]) -> Result<usize, GeofenceError> {
        let mut added = 0;
        for seed in seeds {
            if let Some(id) = &seed.id {
                if self.backend.get(id).await?.is_some() {
                    continue;
                }
            }
            match self.create(seed.clone()).await {
                Ok(_) => added += 1,
                Err(GeofenceError::Validation(e)) => {
                    warn!(name = %seed.name, error = %e, "geofence_seed_invalid");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::geofence::{GeofenceCategory, GeofenceMetadata, GeofenceShape};
    use crate::domain::types::LatLon;
    use crate::error::ValidationError;
    use crate::io::geofence_persistence::InMemoryGeofences;

    fn store() -> GeofenceStore {
        GeofenceStore::new(Arc::new(InMemoryGeofences::new()))
    }

    fn new_circle(id: Option<&str>, radius: f64) -> NewGeofence {
        NewGeofence {
            id: id.map(GeofenceId::from),
            name: "King & University".to_string(),
            description: None,
            shape: GeofenceShape::Circle {
                center: LatLon::new(43.4723, -80.5449),
                radius_meters: radius,
            },
            alert_threshold_minutes: 2,
            active: true,
            category: Some(GeofenceCategory::BusStop),
            metadata: GeofenceMetadata::default(),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_lists() {
        let store = store();
        let created = store.create(new_circle(None, 30.0)).await.unwrap();
        assert!(created.id.0.starts_with("geofence-"));
        assert_eq!(created.created_at, created.updated_at);

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(store.get(&created.id).await.unwrap(), created);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_shape() {
        let store = store();
        let err = store.create(new_circle(None, 0.0)).await.unwrap_err();
        assert!(matches!(err, GeofenceError::Validation(ValidationError::RadiusNotPositive(_))));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_soft_deleted_geofence_disappears() {
        let store = store();
        let created = store.create(new_circle(None, 30.0)).await.unwrap();

        store.soft_delete(&created.id).await.unwrap();

        assert!(store.list().await.unwrap().is_empty());
        assert!(matches!(store.get(&created.id).await, Err(GeofenceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_revalidates_and_reports_missing() {
        let store = store();
        let created = store.create(new_circle(None, 30.0)).await.unwrap();

        let updated = store
            .update(
                &created.id,
                GeofenceUpdate { alert_threshold_minutes: Some(5), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(updated.alert_threshold_minutes, 5);

        let bad = GeofenceUpdate {
            shape: Some(GeofenceShape::Polygon { points: vec![LatLon::new(0.0, 0.0)] }),
            ..Default::default()
        };
        assert!(matches!(
            store.update(&created.id, bad).await,
            Err(GeofenceError::Validation(ValidationError::TooFewPoints(1)))
        ));
        // Failed update leaves the record untouched
        assert_eq!(store.get(&created.id).await.unwrap().alert_threshold_minutes, 5);

        let missing = GeofenceId::from("nope");
        assert!(matches!(
            store.update(&missing, GeofenceUpdate::default()).await,
            Err(GeofenceError::NotFound(_))
        ));
        assert!(matches!(store.soft_delete(&missing).await, Err(GeofenceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_create_with_taken_id_conflicts() {
        let store = store();
        let original = store.create(new_circle(Some("gf-a"), 30.0)).await.unwrap();

        let mut hijack = new_circle(Some("gf-a"), 500.0);
        hijack.name = "Hijacked".to_string();
        let err = store.create(hijack).await.unwrap_err();
        assert!(matches!(err, GeofenceError::AlreadyExists(ref id) if id.0 == "gf-a"));

        let kept = store.get(&original.id).await.unwrap();
        assert_eq!(kept, original);

        // Soft-deleted ids stay reserved
        store.soft_delete(&original.id).await.unwrap();
        assert!(matches!(
            store.create(new_circle(Some("gf-a"), 30.0)).await,
            Err(GeofenceError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_seed_skips_existing_and_invalid() {
        let store = store();
        let seeds = vec![
            new_circle(Some("gf-a"), 30.0),
            new_circle(Some("gf-b"), -1.0),
            new_circle(Some("gf-c"), 80.0),
        ];
        assert_eq!(store.seed(&seeds).await.unwrap(), 2);
        assert_eq!(store.seed(&seeds).await.unwrap(), 0);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }
}
