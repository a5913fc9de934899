//! Management HTTP API, health, stats, Prometheus text and the `/ws` upgrade
//!
//! Plain `hyper` HTTP/1.1 with a `match` on method and path segments.
//! Every JSON body is camelCase; failures answer `{"error": "..."}`.

use crate::domain::geofence::{GeofenceUpdate, NewGeofence};
use crate::domain::types::{AlertId, GeofenceId, VehicleId, VehicleLocation};
use crate::error::GeofenceError;
use crate::infra::metrics::Metrics;
use crate::io::location_store::InMemoryLocationStore;
use crate::io::prometheus::{format_prometheus_metrics, Gauges};
use crate::io::ws::serve_socket;
use crate::services::dispatcher::AlertDispatcher;
use crate::services::eta::EtaEngine;
use crate::services::geofence_store::GeofenceStore;
use crate::services::monitor::ProximityMonitor;
use crate::services::subscribers::SubscriberRegistry;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{error, info, warn};

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Everything a request handler can reach
#[derive(Clone)]
pub struct AppState {
    pub geofences: Arc<GeofenceStore>,
    pub engine: Arc<EtaEngine>,
    pub dispatcher: Arc<AlertDispatcher>,
    pub registry: Arc<SubscriberRegistry>,
    pub monitor: Arc<ProximityMonitor>,
    pub metrics: Arc<Metrics>,
    /// Present when positions are pushed in-process; enables `POST /api/locations`
    pub location_feed: Option<Arc<InMemoryLocationStore>>,
    pub heartbeat: Duration,
}

impl AppState {
    fn gauges(&self) -> Gauges {
        let stats = self.engine.cache_stats();
        Gauges {
            tracked_vehicles: self.monitor.tracked_vehicles(),
            active_alerts: self.dispatcher.active_count(),
            subscribers: self.registry.len(),
            eta_cache_size: stats.size,
            routing_calls_in_window: stats.api_calls_in_window,
            routing_rate_limited: stats.rate_limited,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest {
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LocationBatch {
    One(VehicleLocation),
    Many(Vec<VehicleLocation>),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    timestamp: String,
    version: &'static str,
    revision: &'static str,
    websocket_connections: usize,
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .body(Full::new(Bytes::from(body)))
            .expect("static response should not fail"),
        Err(e) => {
            error!(error = %e, "http_response_serialize_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Full::new(Bytes::from(json!({ "error": message }).to_string())))
        .expect("static response should not fail")
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Full::new(Bytes::new()))
        .expect("static response should not fail")
}

fn geofence_error_response(e: &GeofenceError, operation: &str) -> Response<Full<Bytes>> {
    match e {
        GeofenceError::NotFound(_) => error_response(StatusCode::NOT_FOUND, "Geofence not found"),
        GeofenceError::AlreadyExists(_) => {
            error_response(StatusCode::CONFLICT, "Geofence id already exists")
        }
        GeofenceError::Validation(v) => error_response(StatusCode::BAD_REQUEST, &v.to_string()),
        GeofenceError::Store(s) => {
            error!(error = %s, operation = %operation, "geofence_store_error");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Geofence store unavailable")
        }
    }
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, Response<Full<Bytes>>> {
    serde_json::from_slice(body)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, &format!("Invalid request body: {e}")))
}

/// Route one request whose body is already buffered
pub async fn route(state: &AppState, method: &Method, path: &str, body: Bytes) -> Response<Full<Bytes>> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        (&Method::GET, ["health"]) => json_response(
            StatusCode::OK,
            &Health {
                status: "healthy",
                timestamp: Utc::now().to_rfc3339(),
                version: env!("CARGO_PKG_VERSION"),
                revision: env!("GIT_HASH"),
                websocket_connections: state.registry.len(),
            },
        ),
        (&Method::GET, ["stats"]) => json_response(
            StatusCode::OK,
            &json!({
                "etaCache": state.engine.cache_stats(),
                "activeVehicles": state.monitor.tracked_vehicles(),
                "activeAlerts": state.dispatcher.active_count(),
                "subscribers": state.registry.len(),
                "timestamp": Utc::now().to_rfc3339(),
            }),
        ),
        (&Method::GET, ["metrics"]) => {
            let body = format_prometheus_metrics(&state.metrics, &state.gauges());
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail")
        }

        (&Method::GET, ["api", "geofences"]) => match state.geofences.list().await {
            Ok(geofences) => json_response(StatusCode::OK, &geofences),
            Err(e) => geofence_error_response(&e, "list"),
        },
        (&Method::POST, ["api", "geofences"]) => {
            let new: NewGeofence = match parse_body(&body) {
                Ok(new) => new,
                Err(response) => return response,
            };
            match state.geofences.create(new).await {
                Ok(geofence) => json_response(StatusCode::CREATED, &geofence),
                Err(e) => geofence_error_response(&e, "create"),
            }
        }
        (&Method::PUT, ["api", "geofences", id]) => {
            let update: GeofenceUpdate = match parse_body(&body) {
                Ok(update) => update,
                Err(response) => return response,
            };
            match state.geofences.update(&GeofenceId::from(*id), update).await {
                Ok(geofence) => json_response(StatusCode::OK, &geofence),
                Err(e) => geofence_error_response(&e, "update"),
            }
        }
        (&Method::DELETE, ["api", "geofences", id]) => {
            match state.geofences.soft_delete(&GeofenceId::from(*id)).await {
                Ok(()) => empty_response(StatusCode::NO_CONTENT),
                Err(e) => geofence_error_response(&e, "delete"),
            }
        }

        (&Method::GET, ["api", "eta", vehicle_id, geofence_id]) => {
            let eta = state
                .engine
                .calculate_eta(&VehicleId::from(*vehicle_id), &GeofenceId::from(*geofence_id))
                .await;
            match eta {
                Some(eta) => json_response(StatusCode::OK, &eta),
                None => error_response(StatusCode::NOT_FOUND, "Unable to calculate ETA"),
            }
        }

        (&Method::GET, ["api", "alerts"]) => json_response(StatusCode::OK, &state.dispatcher.active_alerts()),
        (&Method::POST, ["api", "alerts", id, "acknowledge"]) => {
            let request: AcknowledgeRequest = match parse_body(&body) {
                Ok(request) => request,
                Err(response) => return response,
            };
            let Some(user_id) = request.user_id.filter(|u| !u.is_empty()) else {
                return error_response(StatusCode::BAD_REQUEST, "userId is required");
            };
            if state.dispatcher.acknowledge_alert(&AlertId::from(*id), &user_id).await {
                json_response(StatusCode::OK, &json!({ "message": "Alert acknowledged" }))
            } else {
                error_response(StatusCode::NOT_FOUND, "Alert not found")
            }
        }

        (&Method::POST, ["api", "locations"]) => {
            let Some(feed) = &state.location_feed else {
                return error_response(StatusCode::NOT_FOUND, "Location feed not enabled");
            };
            let batch = match parse_body(&body) {
                Ok(LocationBatch::One(location)) => vec![location],
                Ok(LocationBatch::Many(locations)) => locations,
                Err(response) => return response,
            };
            if batch.iter().any(|l| !l.position().is_valid()) {
                return error_response(StatusCode::BAD_REQUEST, "Invalid coordinate");
            }
            let accepted = batch.len();
            for location in batch {
                feed.upsert(location);
            }
            json_response(StatusCode::ACCEPTED, &json!({ "accepted": accepted }))
        }

        (&Method::OPTIONS, _) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .header(header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, PUT, DELETE, OPTIONS")
            .header(header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type")
            .body(Full::new(Bytes::new()))
            .expect("static response should not fail"),
        _ => error_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Answer the handshake and hand the upgraded connection to a feed session
fn upgrade_websocket(
    mut req: Request<hyper::body::Incoming>,
    state: &AppState,
    shutdown: watch::Receiver<bool>,
) -> Response<Full<Bytes>> {
    let Some(key) = req.headers().get(header::SEC_WEBSOCKET_KEY) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key");
    };
    let accept = derive_accept_key(key.as_bytes());
    let Ok(accept) = HeaderValue::from_str(&accept) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid Sec-WebSocket-Key");
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    let registry = state.registry.clone();
    let heartbeat = state.heartbeat;
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                serve_socket(ws, registry, heartbeat, shutdown).await;
            }
            Err(e) => warn!(error = %e, "ws_upgrade_failed"),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept)
        .body(Full::new(Bytes::new()))
        .expect("static response should not fail")
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: AppState,
    shutdown: watch::Receiver<bool>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() == Method::GET && req.uri().path() == "/ws" {
        if !is_websocket_upgrade(&req) {
            return Ok(error_response(StatusCode::BAD_REQUEST, "Expected WebSocket upgrade"));
        }
        return Ok(upgrade_websocket(req, &state, shutdown));
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, path = %path, "http_body_read_failed");
            return Ok(error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large"));
        }
    };

    Ok(route(&state, &method, &path, body).await)
}

/// Start the HTTP server and accept connections until shutdown
pub async fn start_http_server(
    addr: SocketAddr,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "http_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();
                        let session_shutdown = shutdown.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                let shutdown = session_shutdown.clone();
                                async move { handle_request(req, state, shutdown).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .with_upgrades()
                                .await
                            {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
