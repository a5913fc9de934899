//! Alert persistence
//!
//! Alerts are written in JSONL format (one JSON record per line). Each line
//! is either a `put` carrying the full alert and its expiry, or an `ack`
//! recording who acknowledged an alert and when. Readers replay the file in
//! order. `purge_expired` rewrites the log without `put` records past their
//! `expiresAt` and the `ack` lines that refer to them.

use crate::domain::alert::Alert;
use crate::domain::types::AlertId;
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[async_trait]
pub trait AlertPersistence: Send + Sync {
    /// Store an alert that self-expires after `ttl`
    async fn put(&self, alert: &Alert, ttl: Duration) -> Result<(), StoreError>;

    async fn update_acknowledged(
        &self,
        id: &AlertId,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Discard alerts whose TTL has elapsed at `now`; returns how many went
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum AlertRecord<'a> {
    Put {
        alert: &'a Alert,
        #[serde(rename = "expiresAt")]
        expires_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Ack { alert_id: &'a AlertId, acknowledged_by: &'a str, acknowledged_at: DateTime<Utc> },
}

/// Append-only JSONL alert log
pub struct JsonlAlertStore {
    path: PathBuf,
    /// Serializes appends so lines never interleave
    write_lock: Mutex<()>,
}

impl JsonlAlertStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        info!(file_path = %path.display(), "alert_store_initialized");
        Self { path, write_lock: Mutex::new(()) }
    }

    async fn append(&self, record: &AlertRecord<'_>) -> Result<(), StoreError> {
        let line = serde_json::to_string(record)?;
        let _guard = self.write_lock.lock().await;
        append_line(&self.path, &line)?;
        debug!(file = %self.path.display(), bytes = %line.len(), "alert_record_written");
        Ok(())
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Alert ids of `put` lines that expired at or before `now`
fn expired_ids<'a>(
    records: impl Iterator<Item = &'a serde_json::Value>,
    now: DateTime<Utc>,
) -> FxHashSet<String> {
    records
        .filter(|record| record["op"] == "put")
        .filter(|record| {
            record["expiresAt"]
                .as_str()
                .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
                .is_some_and(|at| at <= now)
        })
        .filter_map(|record| record["alert"]["id"].as_str().map(str::to_string))
        .collect()
}

fn refers_to(record: &serde_json::Value, expired: &FxHashSet<String>) -> bool {
    let id = match record["op"].as_str() {
        Some("put") => record["alert"]["id"].as_str(),
        Some("ack") => record["alertId"].as_str(),
        _ => None,
    };
    id.is_some_and(|id| expired.contains(id))
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl AlertPersistence for JsonlAlertStore {
    async fn put(&self, alert: &Alert, ttl: Duration) -> Result<(), StoreError> {
        self.append(&AlertRecord::Put { alert, expires_at: expiry(ttl) }).await
    }

    async fn update_acknowledged(
        &self,
        id: &AlertId,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.append(&AlertRecord::Ack { alert_id: id, acknowledged_by: user_id, acknowledged_at: at })
            .await
    }

    /// Rewrite the log via a temp file and rename; lines that do not parse are kept
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<(&str, serde_json::Value)> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| (line, serde_json::from_str(line).unwrap_or(serde_json::Value::Null)))
            .collect();
        let expired = expired_ids(lines.iter().map(|(_, record)| record), now);
        if expired.is_empty() {
            return Ok(0);
        }

        let mut kept = String::with_capacity(content.len());
        for (line, record) in &lines {
            if !refers_to(record, &expired) {
                kept.push_str(line);
                kept.push('\n');
            }
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, kept.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        info!(file = %self.path.display(), purged = %expired.len(), "alert_log_compacted");
        Ok(expired.len())
    }
}

struct StoredAlert {
    alert: Alert,
    expires_at: DateTime<Utc>,
}

/// Process-local alert store; expired alerts are invisible to `get`
#[derive(Default)]
pub struct InMemoryAlertStore {
    alerts: RwLock<FxHashMap<AlertId, StoredAlert>>,
}

impl InMemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &AlertId) -> Option<Alert> {
        let alerts = self.alerts.read();
        alerts
            .get(id)
            .filter(|stored| stored.expires_at > Utc::now())
            .map(|stored| stored.alert.clone())
    }

    pub fn len(&self) -> usize {
        self.alerts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.read().is_empty()
    }
}

#[async_trait]
impl AlertPersistence for InMemoryAlertStore {
    async fn put(&self, alert: &Alert, ttl: Duration) -> Result<(), StoreError> {
        let stored = StoredAlert { alert: alert.clone(), expires_at: expiry(ttl) };
        self.alerts.write().insert(alert.id.clone(), stored);
        Ok(())
    }

    async fn update_acknowledged(
        &self,
        id: &AlertId,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(stored) = self.alerts.write().get_mut(id) {
            stored.alert.acknowledge(user_id, at);
        }
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut alerts = self.alerts.write();
        let before = alerts.len();
        alerts.retain(|_, stored| stored.expires_at > now);
        Ok(before - alerts.len())
    }
}
