//! Text translation endpoint

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use parley_core::InferenceRequest;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TranslateRequest {
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
}

#[derive(Debug, Serialize)]
pub struct TranslateResponse {
    pub text: String,
}

pub async fn translate(
    State(state): State<AppState>,
    body: Result<Json<TranslateRequest>, JsonRejection>,
) -> Result<Json<TranslateResponse>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    info!(
        "Translation request: {} chars, {} -> {}",
        req.text.chars().count(),
        req.source_lang,
        req.target_lang
    );

    let request = InferenceRequest::translation(req.text, req.source_lang, req.target_lang);
    let result = state.run(request).await?;

    Ok(Json(TranslateResponse {
        text: result.output.text().unwrap_or_default().to_string(),
    }))
}
