//! Geofence alerts - proximity monitoring and alerting for transit vehicles
//!
//! Watches vehicle positions against configured geofences, estimates arrival
//! times and pushes classified alerts to WebSocket subscribers.
//!
//! Module structure:
//! - `domain/` - Core types (Geofence, VehicleLocation, EtaResult, Alert)
//! - `io/` - External interfaces (location store, routing, persistence, MQTT, HTTP/WS)
//! - `services/` - Business logic (ETA engine, ProximityMonitor, AlertDispatcher)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use geofence_alerts::infra::config::LocationStoreKind;
use geofence_alerts::infra::{Config, Metrics};
use geofence_alerts::io::{
    escalation_channel, start_http_server, AlertPersistence, AppState, EscalationChannel,
    GeofencePersistence, InMemoryAlertStore, InMemoryGeofences, InMemoryLocationStore,
    JsonFileGeofences, JsonlAlertStore, LocationStore, LogOnlyEscalation, MapboxRouting,
    MqttPublisher, RoutingProvider, TrackStoreClient,
};
use geofence_alerts::services::{
    AlertDispatcher, DispatcherSettings, EtaEngine, EtaSettings, GeofenceStore, MonitorSettings,
    ProximityMonitor, SubscriberRegistry,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Geofence proximity alerting service
#[derive(Parser, Debug)]
#[command(name = "geofence-alerts", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-vehicle decisions
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!("geofence-alerts starting");

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        bind_address = %config.bind_address(),
        http_port = %config.http_port(),
        check_interval_secs = %config.monitor().check_interval_secs,
        routing_enabled = %config.routing_enabled(),
        location_store = ?config.location_store().kind,
        geofence_file = ?config.geofence_file(),
        alerts_file = ?config.alerts_file(),
        escalation_enabled = %config.escalation().enabled,
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Location source
    let (locations, location_feed): (Arc<dyn LocationStore>, Option<Arc<InMemoryLocationStore>>) =
        match config.location_store().kind {
            LocationStoreKind::Memory => {
                let store = Arc::new(InMemoryLocationStore::new());
                (store.clone(), Some(store))
            }
            LocationStoreKind::Trackstore => {
                let store_config = config.location_store();
                let client = TrackStoreClient::new(
                    &store_config.url,
                    Duration::from_millis(store_config.timeout_ms),
                    store_config.max_in_flight,
                )
                .context("Failed to build trackstore client")?;
                (Arc::new(client), None)
            }
        };

    // Routing provider (absent means projection and historical fallbacks only)
    let routing: Option<Arc<dyn RoutingProvider>> = if config.routing_enabled() {
        let routing_config = config.routing();
        let api_key = routing_config.api_key.as_deref().unwrap_or_default();
        let provider = MapboxRouting::new(
            &routing_config.base_url,
            &routing_config.profile,
            api_key,
            Duration::from_millis(routing_config.timeout_ms),
        )
        .context("Failed to build routing client")?;
        Some(Arc::new(provider))
    } else {
        warn!("routing_disabled_using_fallbacks");
        None
    };

    // Geofences
    let geofence_backend: Arc<dyn GeofencePersistence> = match config.geofence_file() {
        Some(path) => Arc::new(
            JsonFileGeofences::open(path)
                .await
                .with_context(|| format!("Failed to open geofence file {path}"))?,
        ),
        None => Arc::new(InMemoryGeofences::new()),
    };
    let geofences = Arc::new(GeofenceStore::new(geofence_backend));
    let seeded = geofences.seed(config.geofence_seeds()).await.context("Failed to seed geofences")?;
    info!(seeded = %seeded, "geofences_seeded");

    // Alert persistence
    let alert_store: Arc<dyn AlertPersistence> = match config.alerts_file() {
        Some(path) => Arc::new(JsonlAlertStore::new(path)),
        None => Arc::new(InMemoryAlertStore::new()),
    };

    // Escalation channel and MQTT publisher (if enabled)
    let mut background = Vec::new();
    let escalation: Arc<dyn EscalationChannel> = if config.escalation().enabled {
        let (channel, escalation_rx) = escalation_channel(config.escalation().queue_size);
        let publisher = MqttPublisher::new(config.escalation(), escalation_rx);
        let publisher_shutdown = shutdown_rx.clone();
        background.push(tokio::spawn(async move {
            publisher.run(publisher_shutdown).await;
        }));
        Arc::new(channel)
    } else {
        Arc::new(LogOnlyEscalation)
    };

    let registry = Arc::new(SubscriberRegistry::new(config.subscriber_buffer(), metrics.clone()));
    let engine = Arc::new(EtaEngine::new(
        EtaSettings::from_config(&config),
        locations.clone(),
        geofences.clone(),
        routing,
        metrics.clone(),
    ));
    let dispatcher = Arc::new(AlertDispatcher::new(
        DispatcherSettings::from_config(&config),
        alert_store,
        registry.clone(),
        escalation,
        metrics.clone(),
    ));
    let monitor = Arc::new(ProximityMonitor::new(
        MonitorSettings::from_config(&config),
        locations,
        geofences.clone(),
        engine.clone(),
        dispatcher.clone(),
        metrics.clone(),
    ));

    let pruner = dispatcher.clone();
    let pruner_shutdown = shutdown_rx.clone();
    background.push(tokio::spawn(async move {
        pruner.run_pruner(pruner_shutdown).await;
    }));

    let monitor_task = monitor.clone();
    let monitor_shutdown = shutdown_rx.clone();
    background.push(tokio::spawn(async move {
        monitor_task.run(monitor_shutdown).await;
    }));

    // HTTP API, metrics and the WebSocket feed
    let addr: SocketAddr = format!("{}:{}", config.bind_address(), config.http_port())
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.bind_address()))?;
    let state = AppState {
        geofences,
        engine,
        dispatcher,
        registry,
        monitor,
        metrics,
        location_feed,
        heartbeat: Duration::from_secs(config.heartbeat_secs().max(1)),
    };
    let http_shutdown = shutdown_rx.clone();
    background.push(tokio::spawn(async move {
        if let Err(e) = start_http_server(addr, state, http_shutdown).await {
            error!(error = %e, "http_server_error");
        }
    }));

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(config.monitor().shutdown_grace_secs.max(1));
    if tokio::time::timeout(grace, futures_util::future::join_all(background)).await.is_err() {
        warn!(grace_secs = %grace.as_secs(), "shutdown_grace_elapsed");
    }

    info!("geofence-alerts shutdown complete");
    Ok(())
}
