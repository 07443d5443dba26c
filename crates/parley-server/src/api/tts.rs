//! Text-to-speech endpoint

use axum::{
    extract::{Multipart, Request, State},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    Json, RequestExt,
};
use base64::Engine;
use parley_core::runtime::RequestPayload;
use parley_core::{AudioData, InferenceRequest, OutputPayload, TtsResponseFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Deserialize)]
pub struct TtsRequest {
    pub text: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// Base64 encoded WAV for voice cloning
    #[serde(default)]
    pub reference_audio: Option<String>,
    #[serde(default)]
    pub reference_text: Option<String>,
}

/// JSON envelope used by deployments configured with `response = "json"`.
#[derive(Debug, Serialize)]
pub struct TtsEnvelope {
    pub audio: String,
    pub duration: f32,
    pub sample_rate: u32,
}

struct ParsedTts {
    text: String,
    language: String,
    reference_audio: Option<AudioData>,
    reference_text: Option<String>,
}

pub async fn synthesize(State(state): State<AppState>, req: Request) -> Result<Response, ApiError> {
    let parsed = parse_tts_request(req).await?;
    info!(
        "TTS request: {} chars, language={}, reference={}",
        parsed.text.chars().count(),
        parsed.language,
        parsed.reference_audio.is_some()
    );

    let request = InferenceRequest::new(RequestPayload::Synthesis {
        text: parsed.text,
        language: parsed.language,
        reference_audio: parsed.reference_audio,
        reference_text: parsed.reference_text,
    });
    let result = state.run(request).await?;

    let OutputPayload::Audio {
        wav,
        sample_rate,
        duration_secs,
    } = result.output
    else {
        return Err(ApiError::internal("TTS generation failed: no audio produced"));
    };

    info!(
        "Generated {:.2}s of audio via {} in {:.2}s",
        duration_secs,
        result.backend,
        result.trace.total().as_secs_f64()
    );

    let response = match state.pipeline.config().synthesis.response {
        TtsResponseFormat::Raw => ([(CONTENT_TYPE, "audio/wav")], wav).into_response(),
        TtsResponseFormat::Json => Json(TtsEnvelope {
            audio: base64::engine::general_purpose::STANDARD.encode(&wav),
            duration: duration_secs,
            sample_rate,
        })
        .into_response(),
    };
    Ok(response)
}

async fn parse_tts_request(req: Request) -> Result<ParsedTts, ApiError> {
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

        let mut text = None;
        let mut language = default_language();
        let mut reference_audio = None;
        let mut reference_text = None;

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed reading multipart field: {e}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "reference_audio" => {
                    let bytes = field.bytes().await.map_err(|e| {
                        ApiError::bad_request(format!("Failed reading reference audio: {e}"))
                    })?;
                    if !bytes.is_empty() {
                        reference_audio = Some(AudioData::Bytes(bytes.to_vec()));
                    }
                }
                "text" | "language" | "reference_text" => {
                    let value = field.text().await.map_err(|e| {
                        ApiError::bad_request(format!("Invalid {name} field: {e}"))
                    })?;
                    match name.as_str() {
                        "text" => text = Some(value),
                        "language" if !value.trim().is_empty() => {
                            language = value.trim().to_string()
                        }
                        "reference_text" if !value.trim().is_empty() => {
                            reference_text = Some(value)
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        return Ok(ParsedTts {
            text: text.ok_or_else(|| ApiError::bad_request("Missing text field"))?,
            language,
            reference_audio,
            reference_text,
        });
    }

    let Json(payload) = req
        .extract::<Json<TtsRequest>, _>()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?;

    Ok(ParsedTts {
        text: payload.text,
        language: payload.language,
        reference_audio: payload
            .reference_audio
            .filter(|a| !a.trim().is_empty())
            .map(AudioData::Base64),
        reference_text: payload.reference_text,
    })
}
