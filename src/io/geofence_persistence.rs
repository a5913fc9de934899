//! Geofence persistence backends
//!
//! - `InMemoryGeofences` - process-local map
//! - `JsonFileGeofences` - map mirrored to a JSON snapshot file after every write

use crate::domain::geofence::Geofence;
use crate::domain::types::GeofenceId;
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Durable record store for geofence definitions.
///
/// Records are returned regardless of their `active` flag; filtering is the
/// caller's concern.
#[async_trait]
pub trait GeofencePersistence: Send + Sync {
    async fn get(&self, id: &GeofenceId) -> Result<Option<Geofence>, StoreError>;
    async fn list(&self) -> Result<Vec<Geofence>, StoreError>;
    async fn put(&self, geofence: &Geofence) -> Result<(), StoreError>;
    /// Mark a record inactive; `false` when the id is unknown
    async fn soft_delete(&self, id: &GeofenceId) -> Result<bool, StoreError>;
}

#[derive(Default)]
pub struct InMemoryGeofences {
    records: RwLock<FxHashMap<GeofenceId, Geofence>>,
}

impl InMemoryGeofences {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Vec<Geofence> {
        sorted(self.records.read().values().cloned().collect())
    }

    fn mark_inactive(&self, id: &GeofenceId) -> bool {
        let mut records = self.records.write();
        match records.get_mut(id) {
            Some(geofence) => {
                deactivate(geofence);
                true
            }
            None => false,
        }
    }
}

fn sorted(mut all: Vec<Geofence>) -> Vec<Geofence> {
    all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    all
}

fn deactivate(geofence: &mut Geofence) {
    geofence.active = false;
    geofence.updated_at = Utc::now();
}

#[async_trait]
impl GeofencePersistence for InMemoryGeofences {
    async fn get(&self, id: &GeofenceId) -> Result<Option<Geofence>, StoreError> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Geofence>, StoreError> {
        Ok(self.snapshot())
    }

    async fn put(&self, geofence: &Geofence) -> Result<(), StoreError> {
        self.records.write().insert(geofence.id.clone(), geofence.clone());
        Ok(())
    }

    async fn soft_delete(&self, id: &GeofenceId) -> Result<bool, StoreError> {
        Ok(self.mark_inactive(id))
    }
}

/// Geofences kept in memory and rewritten to a JSON array file on change.
///
/// A change becomes visible only after the snapshot carrying it is on disk,
/// so a failed write leaves both the file and the live set untouched.
pub struct JsonFileGeofences {
    path: PathBuf,
    inner: InMemoryGeofences,
    /// Serializes snapshot writes so a stale snapshot never overwrites a newer one
    write_lock: Mutex<()>,
}

impl JsonFileGeofences {
    /// Open the snapshot, starting empty when the file does not exist yet
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let inner = InMemoryGeofences::new();

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let geofences: Vec<Geofence> = serde_json::from_slice(&bytes)?;
                info!(file = %path.display(), count = %geofences.len(), "geofences_loaded");
                let mut records = inner.records.write();
                for geofence in geofences {
                    records.insert(geofence.id.clone(), geofence);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(file = %path.display(), "geofence_snapshot_missing_starting_empty");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self { path, inner, write_lock: Mutex::new(()) })
    }

    /// Current records with `change` applied, without touching the live map
    fn staged(&self, change: impl FnOnce(&mut FxHashMap<GeofenceId, Geofence>)) -> Vec<Geofence> {
        let mut records = self.inner.records.read().clone();
        change(&mut records);
        sorted(records.into_values().collect())
    }

    /// Write via a temp file and rename so readers never see a partial snapshot
    async fn flush(&self, snapshot: &[Geofence]) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(snapshot)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(file = %self.path.display(), bytes = %json.len(), "geofence_snapshot_written");
        Ok(())
    }
}

#[async_trait]
impl GeofencePersistence for JsonFileGeofences {
    async fn get(&self, id: &GeofenceId) -> Result<Option<Geofence>, StoreError> {
        self.inner.get(id).await
    }

    async fn list(&self) -> Result<Vec<Geofence>, StoreError> {
        self.inner.list().await
    }

    async fn put(&self, geofence: &Geofence) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.staged(|records| {
            records.insert(geofence.id.clone(), geofence.clone());
        });
        self.flush(&snapshot).await?;
        self.inner.put(geofence).await
    }

    async fn soft_delete(&self, id: &GeofenceId) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let existing = self.inner.records.read().get(id).cloned();
        let Some(mut record) = existing else {
            return Ok(false);
        };
        deactivate(&mut record);

        let snapshot = self.staged(|records| {
            records.insert(record.id.clone(), record.clone());
        });
        self.flush(&snapshot).await?;
        self.inner.put(&record).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::geofence::{GeofenceMetadata, GeofenceShape, NewGeofence};
    use crate::domain::types::LatLon;
    use tempfile::tempdir;

    fn geofence(id: &str) -> Geofence {
        NewGeofence {
            id: Some(GeofenceId::from(id)),
            name: format!("Stop {id}"),
            description: None,
            shape: GeofenceShape::Circle {
                center: LatLon::new(43.4723, -80.5449),
                radius_meters: 50.0,
            },
            alert_threshold_minutes: 3,
            active: true,
            category: None,
            metadata: GeofenceMetadata::default(),
        }
        .into_geofence(Utc::now())
    }

    #[tokio::test]
    async fn test_in_memory_soft_delete_keeps_record() {
        let store = InMemoryGeofences::new();
        store.put(&geofence("gf-1")).await.unwrap();

        assert!(store.soft_delete(&GeofenceId::from("gf-1")).await.unwrap());
        assert!(!store.soft_delete(&GeofenceId::from("missing")).await.unwrap());

        let record = store.get(&GeofenceId::from("gf-1")).await.unwrap().unwrap();
        assert!(!record.active);
    }

    #[tokio::test]
    async fn test_json_file_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("geofences.json");

        let store = JsonFileGeofences::open(&path).await.unwrap();
        store.put(&geofence("gf-1")).await.unwrap();
        store.put(&geofence("gf-2")).await.unwrap();
        store.soft_delete(&GeofenceId::from("gf-2")).await.unwrap();
        drop(store);

        let reopened = JsonFileGeofences::open(&path).await.unwrap();
        let all = reopened.list().await.unwrap();
        assert_eq!(all.len(), 2);
        let gf2 = reopened.get(&GeofenceId::from("gf-2")).await.unwrap().unwrap();
        assert!(!gf2.active);
    }

    /// Replace the snapshot path with a non-empty directory so the rename fails
    fn block_snapshot(path: &Path) {
        let _ = std::fs::remove_file(path);
        std::fs::create_dir_all(path.join("occupied")).unwrap();
    }

    #[tokio::test]
    async fn test_failed_write_leaves_live_set_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("geofences.json");

        let store = JsonFileGeofences::open(&path).await.unwrap();
        store.put(&geofence("gf-1")).await.unwrap();
        block_snapshot(&path);

        let err = store.put(&geofence("gf-x")).await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(store.get(&GeofenceId::from("gf-x")).await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap().len(), 1);

        assert!(store.soft_delete(&GeofenceId::from("gf-1")).await.is_err());
        assert!(store.get(&GeofenceId::from("gf-1")).await.unwrap().unwrap().active);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_json_file_rejects_corrupt_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("geofences.json");
        std::fs::write(&path, "not json").unwrap();

        let result = JsonFileGeofences::open(&path).await;
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }
}
