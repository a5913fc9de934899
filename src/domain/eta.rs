//! Arrival-time estimates

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Strategy that produced an estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EtaMethod {
    RoutingApi,
    GpsProjection,
    HistoricalAverage,
    Arrived,
}

impl EtaMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EtaMethod::RoutingApi => "routing_api",
            EtaMethod::GpsProjection => "gps_projection",
            EtaMethod::HistoricalAverage => "historical_average",
            EtaMethod::Arrived => "arrived",
        }
    }
}

/// Road route as reported by the routing provider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSummary {
    pub duration_seconds: f64,
    pub distance_meters: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtaResult {
    /// Whole minutes, rounded to nearest
    pub estimated_arrival_minutes: u32,
    pub distance_meters: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteSummary>,
    pub confidence: Confidence,
    pub method: EtaMethod,
}

impl EtaResult {
    pub fn arrived(distance_meters: f64) -> Self {
        Self {
            estimated_arrival_minutes: 0,
            distance_meters,
            route: None,
            confidence: Confidence::High,
            method: EtaMethod::Arrived,
        }
    }

    /// Convert a fractional minute estimate into the rounded whole-minute form
    pub fn round_minutes(minutes: f64) -> u32 {
        if minutes.is_finite() && minutes > 0.0 {
            minutes.round().min(u32::MAX as f64) as u32
        } else {
            0
        }
    }
}
