//! Integration tests for configuration loading

use geofence_alerts::domain::geofence::GeofenceShape;
use geofence_alerts::infra::config::LocationStoreKind;
use geofence_alerts::infra::Config;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[server]
bind_address = "127.0.0.1"
port = 8088

[monitor]
check_interval_secs = 15
cooldown_secs = 120
batch_size = 5

[eta]
cache_ttl_secs = 30

[routing]
enabled = false

[location_store]
kind = "trackstore"
url = "http://trackstore:8000"
max_in_flight = 4

[alerts]
file = "/var/lib/geofence/alerts.jsonl"
ttl_hours = 12

[escalation]
enabled = true
host = "broker"
topic = "ops/escalations"

[websocket]
heartbeat_secs = 20

[metrics]
interval_secs = 15

[[geofences]]
id = "stop-king-st"
name = "King St"
alertThresholdMinutes = 5
category = "bus_stop"
shape = { type = "circle", center = { lat = 43.4723, lon = -80.5449 }, radiusMeters = 120.0 }
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.bind_address(), "127.0.0.1");
    assert_eq!(config.http_port(), 8088);
    assert_eq!(config.monitor().check_interval_secs, 15);
    assert_eq!(config.monitor().cooldown_secs, 120);
    assert_eq!(config.monitor().batch_size, 5);
    assert_eq!(config.eta().cache_ttl_secs, 30);
    assert!(!config.routing_enabled());
    assert_eq!(config.location_store().kind, LocationStoreKind::Trackstore);
    assert_eq!(config.location_store().max_in_flight, 4);
    assert_eq!(config.alerts_file(), Some("/var/lib/geofence/alerts.jsonl"));
    assert_eq!(config.alerts().ttl_hours, 12);
    assert!(config.escalation().enabled);
    assert_eq!(config.escalation().topic, "ops/escalations");
    assert_eq!(config.heartbeat_secs(), 20);
    assert_eq!(config.metrics_interval_secs(), 15);

    let seeds = config.geofence_seeds();
    assert_eq!(seeds.len(), 1);
    assert_eq!(seeds[0].name, "King St");
    assert!(matches!(seeds[0].shape, GeofenceShape::Circle { radius_meters, .. } if radius_meters == 120.0));
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.config_file(), "default");
    assert_eq!(config.http_port(), 3000);
    assert_eq!(config.location_store().kind, LocationStoreKind::Memory);
    assert_eq!(config.location_store().max_in_flight, 10);
    assert!(!config.escalation().enabled);
}

#[test]
fn test_malformed_file_is_an_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[monitor\ncooldown_secs = ").unwrap();
    temp_file.flush().unwrap();

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("Failed to parse config file"));
}
