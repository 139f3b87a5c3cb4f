//! Health, readiness, and statistics endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check with store backend status
//! - `GET /ready` - Kubernetes-compatible readiness probe
//! - `GET /stats` - Decision and event counters
//!
//! # Health vs Readiness
//!
//! - **Health** (`/health`): Returns 200 even if degraded, includes details
//! - **Readiness** (`/ready`): Always 200 once the server is listening. The
//!   gateway keeps enforcing on the local store when Redis is down, so a
//!   degraded store is not a reason to pull the instance out of rotation.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::instrument;

use crate::models::{HealthResponse, StatsResponse};
use crate::state::AppState;

/// Health check endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "degraded",
///   "store_backend": "memory",
///   "version": "0.1.0",
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let degraded = state.store.is_degraded().await;

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "healthy" }.to_string(),
        store_backend: state.store.active_backend().await.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint for Kubernetes probes.
#[instrument]
pub async fn readiness_check() -> StatusCode {
    StatusCode::OK
}

/// Statistics endpoint.
///
/// Counters are per instance and reset on restart.
#[instrument(skip(state))]
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let decisions = state.gateway.stats();

    Json(StatsResponse {
        uptime_seconds: state.uptime_seconds(),
        requests_allowed: decisions.allowed,
        requests_throttled: decisions.throttled,
        requests_blocked: decisions.blocked,
        inspections_failed_open: decisions.failed_open,
        events_logged: state.events.events_logged(),
        events_dropped: state.events.events_dropped(),
        tracked_ips: state.gateway.detector().tracked(),
        store_circuit: state.store.circuit_state().await.as_str().to_string(),
    })
}
