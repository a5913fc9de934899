//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Every section is optional; missing keys take the defaults below.

use crate::domain::geofence::NewGeofence;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationStoreKind {
    /// Positions held in process (fed by the HTTP API or tests)
    Memory,
    /// Remote trackstore service over HTTP
    Trackstore,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0".to_string(), port: 3000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub check_interval_secs: u64,
    pub cooldown_secs: u64,
    pub min_movement_meters: f64,
    pub slow_speed_kmh: f64,
    pub nearby_radius_meters: f64,
    pub batch_size: usize,
    pub heading_tolerance_deg: f64,
    pub eta_budget_factor: f64,
    pub state_ttl_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            cooldown_secs: 300,
            min_movement_meters: 50.0,
            slow_speed_kmh: 5.0,
            nearby_radius_meters: 10_000.0,
            batch_size: 10,
            heading_tolerance_deg: 60.0,
            eta_budget_factor: 1.5,
            state_ttl_secs: 3600,
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EtaConfig {
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub arrived_meters: f64,
    pub routing_max_distance_meters: f64,
    pub routing_heading_tolerance_deg: f64,
    pub min_speed_kmh: f64,
    pub fallback_speed_kmh: f64,
    pub stale_after_secs: u64,
}

impl Default for EtaConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 60,
            cache_capacity: 1000,
            arrived_meters: 100.0,
            routing_max_distance_meters: 5000.0,
            routing_heading_tolerance_deg: 45.0,
            min_speed_kmh: 5.0,
            fallback_speed_kmh: 25.0,
            stale_after_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub enabled: bool,
    pub base_url: String,
    /// Overridden by MAPBOX_API_KEY when set
    pub api_key: Option<String>,
    pub profile: String,
    pub timeout_ms: u64,
    pub max_calls_per_minute: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.mapbox.com".to_string(),
            api_key: None,
            profile: "driving".to_string(),
            timeout_ms: 3000,
            max_calls_per_minute: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocationStoreConfig {
    pub kind: LocationStoreKind,
    pub url: String,
    pub timeout_ms: u64,
    /// Concurrent per-vehicle lookups when sweeping recent positions
    pub max_in_flight: usize,
}

impl Default for LocationStoreConfig {
    fn default() -> Self {
        Self {
            kind: LocationStoreKind::Memory,
            url: "http://localhost:8000".to_string(),
            timeout_ms: 2000,
            max_in_flight: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// JSONL file for persisted alerts (empty keeps alerts in memory only)
    pub file: String,
    pub ttl_hours: u64,
    pub ack_grace_secs: u64,
    pub max_age_secs: u64,
    pub prune_interval_secs: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            file: "alerts.jsonl".to_string(),
            ttl_hours: 24,
            ack_grace_secs: 30,
            max_age_secs: 7200,
            prune_interval_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GeofenceStoreConfig {
    /// JSON snapshot file (empty keeps geofences in memory only)
    pub file: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Publish high priority alerts over MQTT; when false they are only logged
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub queue_size: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 1883,
            topic: "geofence/escalations".to_string(),
            client_id: "geofence-alerts".to_string(),
            username: None,
            password: None,
            queue_size: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub heartbeat_secs: u64,
    pub subscriber_buffer: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self { heartbeat_secs: 30, subscriber_buffer: 256 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub eta: EtaConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub location_store: LocationStoreConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub geofence_store: GeofenceStoreConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub geofences: Vec<NewGeofence>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    config_file: String,
    server: ServerConfig,
    monitor: MonitorConfig,
    eta: EtaConfig,
    routing: RoutingConfig,
    location_store: LocationStoreConfig,
    alerts: AlertsConfig,
    geofence_store: GeofenceStoreConfig,
    escalation: EscalationConfig,
    websocket: WebSocketConfig,
    metrics: MetricsConfig,
    geofence_seeds: Vec<NewGeofence>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let mut routing = toml_config.routing;
        if let Ok(key) = env::var("MAPBOX_API_KEY") {
            if !key.is_empty() {
                routing.api_key = Some(key);
            }
        }

        Self {
            config_file,
            server: toml_config.server,
            monitor: toml_config.monitor,
            eta: toml_config.eta,
            routing,
            location_store: toml_config.location_store,
            alerts: toml_config.alerts,
            geofence_store: toml_config.geofence_store,
            escalation: toml_config.escalation,
            websocket: toml_config.websocket,
            metrics: toml_config.metrics,
            geofence_seeds: toml_config.geofences,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration - tries the TOML file first, falls back to defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Resolve the path from args/env, then load
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(Self::resolve_config_path(args))
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn bind_address(&self) -> &str {
        &self.server.bind_address
    }

    pub fn http_port(&self) -> u16 {
        self.server.port
    }

    pub fn monitor(&self) -> &MonitorConfig {
        &self.monitor
    }

    pub fn eta(&self) -> &EtaConfig {
        &self.eta
    }

    pub fn routing(&self) -> &RoutingConfig {
        &self.routing
    }

    /// Routing is usable only when enabled and a key is present
    pub fn routing_enabled(&self) -> bool {
        self.routing.enabled && self.routing.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    pub fn location_store(&self) -> &LocationStoreConfig {
        &self.location_store
    }

    pub fn alerts(&self) -> &AlertsConfig {
        &self.alerts
    }

    pub fn geofence_file(&self) -> Option<&str> {
        let file = self.geofence_store.file.as_str();
        (!file.is_empty()).then_some(file)
    }

    pub fn alerts_file(&self) -> Option<&str> {
        let file = self.alerts.file.as_str();
        (!file.is_empty()).then_some(file)
    }

    pub fn escalation(&self) -> &EscalationConfig {
        &self.escalation
    }

    pub fn heartbeat_secs(&self) -> u64 {
        self.websocket.heartbeat_secs
    }

    pub fn subscriber_buffer(&self) -> usize {
        self.websocket.subscriber_buffer
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics.interval_secs
    }

    pub fn geofence_seeds(&self) -> &[NewGeofence] {
        &self.geofence_seeds
    }
}
