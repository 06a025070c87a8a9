//! `/health` and `/metrics` endpoints.

use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Serialize;

use parley_telemetry::MetricsSnapshot;

use crate::hub::HubSnapshot;
use crate::server::AppState;

/// Health check response body.
#[derive(Clone, Debug, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"shutting_down"` once shutdown has begun.
    pub status: &'static str,
    pub uptime_secs: u64,
    /// Registered sessions.
    pub sessions: usize,
    /// Conversations with at least one subscriber.
    pub conversations: usize,
    /// Total (conversation, session) pairs.
    pub subscriptions: usize,
}

pub fn health_check(started_at: Instant, hub: &HubSnapshot, shutting_down: bool) -> HealthResponse {
    HealthResponse {
        status: if shutting_down { "shutting_down" } else { "ok" },
        uptime_secs: started_at.elapsed().as_secs(),
        sessions: hub.sessions,
        conversations: hub.conversations(),
        subscriptions: hub.subscriptions(),
    }
}

/// GET /health
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.hub.snapshot().await;
    let shutting_down = state.shutdown.is_shutting_down();
    let status = if shutting_down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(health_check(state.started_at, &snapshot, shutting_down)))
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}
