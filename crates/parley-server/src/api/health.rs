//! Readiness, telemetry and backend status endpoints

use axum::{extract::State, http::StatusCode, Json};
use parley_core::{BackendDescriptor, LifecycleState, TelemetrySnapshot};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// 200 once the model is ready, 503 with the lifecycle state otherwise.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let lifecycle = state.pipeline.lifecycle();
    let current = lifecycle.state();
    let code = if current == LifecycleState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthResponse {
            status: current.as_str(),
            reason: lifecycle.failure_reason(),
        }),
    )
}

pub async fn metrics(State(state): State<AppState>) -> Json<TelemetrySnapshot> {
    Json(state.pipeline.telemetry().snapshot().await)
}

pub async fn backends(State(state): State<AppState>) -> Json<Vec<BackendDescriptor>> {
    Json(state.pipeline.chain().snapshot())
}
