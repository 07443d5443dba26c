//! Speech-to-text endpoint

use axum::{
    extract::{Multipart, Request, State},
    http::header::CONTENT_TYPE,
    Json, RequestExt,
};
use parley_core::{AudioData, InferenceRequest};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Deserialize)]
pub struct TranscribeRequest {
    /// Base64 encoded WAV
    pub audio_data: String,
    #[serde(default = "default_language")]
    pub language: String,
}

#[derive(Debug, Serialize)]
pub struct TranscribeResponse {
    pub text: String,
}

pub async fn transcribe(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<TranscribeResponse>, ApiError> {
    let (audio, language) = parse_transcribe_request(req).await?;
    let request = InferenceRequest::transcription(audio, language);
    let result = state.run(request).await?;

    let text = result.output.text().unwrap_or_default().to_string();
    info!(
        "Transcribed via {} in {:.2}s ({} chars)",
        result.backend,
        result.trace.total().as_secs_f64(),
        text.chars().count()
    );
    Ok(Json(TranscribeResponse { text }))
}

async fn parse_transcribe_request(req: Request) -> Result<(AudioData, String), ApiError> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = req
            .extract::<Multipart, _>()
            .await
            .map_err(|e| ApiError::bad_request(format!("Invalid multipart payload: {e}")))?;

        let mut audio = None;
        let mut language = default_language();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed reading multipart field: {e}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "audio" | "file" | "audio_data" => {
                    let bytes = field.bytes().await.map_err(|e| {
                        ApiError::bad_request(format!("Failed reading audio field: {e}"))
                    })?;
                    audio = Some(AudioData::Bytes(bytes.to_vec()));
                }
                "language" => {
                    let value = field.text().await.map_err(|e| {
                        ApiError::bad_request(format!("Invalid language field: {e}"))
                    })?;
                    if !value.trim().is_empty() {
                        language = value.trim().to_string();
                    }
                }
                _ => {}
            }
        }

        let audio = audio.ok_or_else(|| ApiError::bad_request("No audio data provided"))?;
        return Ok((audio, language));
    }

    let Json(payload) = req
        .extract::<Json<TranscribeRequest>, _>()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?;
    Ok((AudioData::Base64(payload.audio_data), payload.language))
}
