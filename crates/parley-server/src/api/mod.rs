//! API routes and handlers

mod health;
mod transcribe;
mod translate;
mod tts;

use axum::{
    routing::{get, post},
    Router,
};
use parley_core::TaskKind;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the API router. Only the deployment's own task route is mounted.
pub fn create_router(state: AppState) -> Router {
    let task_route = match state.task() {
        TaskKind::Translation => Router::new().route("/translate", post(translate::translate)),
        TaskKind::Synthesis => Router::new().route("/tts", post(tts::synthesize)),
        TaskKind::Transcription => Router::new().route("/transcribe", post(transcribe::transcribe)),
    };

    Router::new()
        .merge(task_route)
        .route("/health", get(health::health_check))
        .route("/metrics", get(health::metrics))
        .route("/backends", get(health::backends))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
