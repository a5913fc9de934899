//! TTL cache for arrival estimates
//!
//! Keys are coarse: positions rounded to 4 decimal degrees
//! (about 11 m) and speeds to 10 km/h buckets, per destination geofence.

use crate::domain::eta::EtaResult;
use crate::domain::types::{GeofenceId, LatLon};
use rustc_hash::FxHashMap;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    lat_e4: i64,
    lon_e4: i64,
    geofence_id: GeofenceId,
    /// Speed rounded to nearest 10 km/h; -1 when speed is unknown
    speed_bucket: i64,
}

impl CacheKey {
    pub fn new(position: LatLon, geofence_id: &GeofenceId, speed_kmh: f64) -> Self {
        let speed_bucket =
            if speed_kmh.is_finite() { ((speed_kmh / 10.0).round() * 10.0) as i64 } else { -1 };
        Self {
            lat_e4: (position.lat * 10_000.0).round() as i64,
            lon_e4: (position.lon * 10_000.0).round() as i64,
            geofence_id: geofence_id.clone(),
            speed_bucket,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    result: EtaResult,
    computed_at: Instant,
}

#[derive(Debug)]
pub struct EtaCache {
    entries: FxHashMap<CacheKey, CacheEntry>,
    ttl: Duration,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl EtaCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self { entries: FxHashMap::default(), ttl, capacity: capacity.max(1), hits: 0, misses: 0 }
    }

    /// Fresh entry for `key`; expired entries are dropped on read
    pub fn get(&mut self, key: &CacheKey, now: Instant) -> Option<EtaResult> {
        let fresh = match self.entries.get(key) {
            Some(entry) if now.duration_since(entry.computed_at) < self.ttl => {
                Some(entry.result.clone())
            }
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        };
        if fresh.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        fresh
    }

    /// Insert, sweeping expired entries first when full and then evicting
    /// the oldest if the sweep freed nothing
    pub fn insert(&mut self, key: CacheKey, result: EtaResult, now: Instant) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.sweep(now);
            if self.entries.len() >= self.capacity {
                let oldest = self
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.computed_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    self.entries.remove(&oldest);
                }
            }
        }
        self.entries.insert(key, CacheEntry { result, computed_at: now });
    }

    /// Remove expired entries, returning how many were dropped
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| now.duration_since(entry.computed_at) < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(lat: f64, speed: f64) -> CacheKey {
        CacheKey::new(LatLon::new(lat, -80.5449), &GeofenceId::from("gf-1"), speed)
    }

    #[test]
    fn test_key_coarsening() {
        assert_eq!(key(43.47231, 31.0), key(43.47229, 34.0));
        assert_ne!(key(43.4723, 31.0), key(43.4724, 31.0));
        assert_ne!(key(43.4723, 34.0), key(43.4723, 36.0));
        assert_ne!(
            CacheKey::new(LatLon::new(43.0, -80.0), &GeofenceId::from("a"), 20.0),
            CacheKey::new(LatLon::new(43.0, -80.0), &GeofenceId::from("b"), 20.0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let mut cache = EtaCache::new(Duration::from_secs(60), 10);
        cache.insert(key(43.0, 20.0), EtaResult::arrived(10.0), Instant::now());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get(&key(43.0, 20.0), Instant::now()).is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get(&key(43.0, 20.0), Instant::now()).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_sweeps_then_evicts_oldest() {
        let mut cache = EtaCache::new(Duration::from_secs(60), 2);
        cache.insert(key(43.0, 20.0), EtaResult::arrived(1.0), Instant::now());
        tokio::time::advance(Duration::from_secs(61)).await;
        cache.insert(key(44.0, 20.0), EtaResult::arrived(2.0), Instant::now());

        // Full: the expired entry is swept instead of evicting a fresh one
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.insert(key(45.0, 20.0), EtaResult::arrived(3.0), Instant::now());
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key(44.0, 20.0), Instant::now()).is_some());

        // Full of fresh entries: oldest goes
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.insert(key(46.0, 20.0), EtaResult::arrived(4.0), Instant::now());
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key(44.0, 20.0), Instant::now()).is_none());
        assert!(cache.get(&key(46.0, 20.0), Instant::now()).is_some());
    }
}
