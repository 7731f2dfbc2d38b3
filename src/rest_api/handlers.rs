//! HTTP handlers for the REST API

use axum::{extract::State, http::StatusCode, Json};
use tracing::instrument;

use crate::controller::HealthState;

use super::dto::{HealthResponse, ReadyResponse, StatusResponse};

/// Liveness: fails only while the device rejects our credentials
#[instrument(skip(state))]
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let (code, status) = if state.is_healthy() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unauthorized")
    };
    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

/// Readiness: the last cycle ran without failures
#[instrument(skip(state))]
pub async fn ready(State(state): State<HealthState>) -> (StatusCode, Json<ReadyResponse>) {
    let last = state.last_cycle();
    let ready = state.is_ready();
    let reason = match &last {
        _ if ready => None,
        None => Some("no cycle has completed yet".to_string()),
        Some(cycle) if cycle.skipped => cycle.skip_reason.clone(),
        Some(cycle) if !cycle.failed.is_empty() => {
            Some(format!("{} operations failed", cycle.failed.len()))
        }
        Some(cycle) if cycle.cancelled > 0 => {
            Some(format!("{} operations cancelled", cycle.cancelled))
        }
        Some(_) => Some("not initialized".to_string()),
    };
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(ReadyResponse {
            ready,
            last_cycle: last.map(|c| c.cycle),
            reason,
        }),
    )
}

#[instrument(skip(state))]
pub async fn status(State(state): State<HealthState>) -> Json<StatusResponse> {
    let objects = state.objects();
    Json(StatusResponse {
        healthy: state.is_healthy(),
        ready: state.is_ready(),
        last_cycle: state.last_cycle(),
        total_objects: objects.len(),
        objects,
    })
}
