//! Runtime request/response types.

use serde::Serialize;
use uuid::Uuid;

use crate::audio::AudioBuffer;
use crate::params::{SynthesisParams, TranscriptionParams, TranslationParams};
use crate::task::TaskKind;
use crate::telemetry::LatencyTrace;

/// Audio handed in by the HTTP layer, either still base64 encoded (JSON
/// bodies) or as raw bytes (multipart uploads).
#[derive(Debug, Clone, PartialEq)]
pub enum AudioData {
    Base64(String),
    Bytes(Vec<u8>),
}

impl AudioData {
    pub fn is_empty(&self) -> bool {
        match self {
            AudioData::Base64(s) => s.trim().is_empty(),
            AudioData::Bytes(b) => b.is_empty(),
        }
    }
}

/// Task-specific request payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPayload {
    Translation {
        text: String,
        source_lang: String,
        target_lang: String,
    },
    Synthesis {
        text: String,
        language: String,
        reference_audio: Option<AudioData>,
        reference_text: Option<String>,
    },
    Transcription {
        audio: AudioData,
        language: String,
    },
}

impl RequestPayload {
    pub fn task(&self) -> TaskKind {
        match self {
            RequestPayload::Translation { .. } => TaskKind::Translation,
            RequestPayload::Synthesis { .. } => TaskKind::Synthesis,
            RequestPayload::Transcription { .. } => TaskKind::Transcription,
        }
    }
}

/// One incoming call. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub id: String,
    pub payload: RequestPayload,
}

impl InferenceRequest {
    pub fn new(payload: RequestPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
        }
    }

    pub fn translation(
        text: impl Into<String>,
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
    ) -> Self {
        Self::new(RequestPayload::Translation {
            text: text.into(),
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
        })
    }

    pub fn synthesis(text: impl Into<String>, language: impl Into<String>) -> Self {
        Self::new(RequestPayload::Synthesis {
            text: text.into(),
            language: language.into(),
            reference_audio: None,
            reference_text: None,
        })
    }

    pub fn transcription(audio: AudioData, language: impl Into<String>) -> Self {
        Self::new(RequestPayload::Transcription {
            audio,
            language: language.into(),
        })
    }

    pub fn task(&self) -> TaskKind {
        self.payload.task()
    }
}

/// Chat-style instruction handed to a translation model.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationInput {
    pub source_language: String,
    pub target_language: String,
    pub system_prompt: String,
    pub text: String,
    pub params: TranslationParams,
}

/// Voice reference for cloning.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceReference {
    pub audio: AudioBuffer,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisInput {
    pub text: String,
    pub language: String,
    pub reference: Option<VoiceReference>,
    pub params: SynthesisParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionInput {
    pub audio: AudioBuffer,
    pub language: String,
    pub params: TranscriptionParams,
}

/// Fully transformed model input.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelInput {
    Translation(TranslationInput),
    Synthesis(SynthesisInput),
    Transcription(TranscriptionInput),
}

impl ModelInput {
    pub fn task(&self) -> TaskKind {
        match self {
            ModelInput::Translation(_) => TaskKind::Translation,
            ModelInput::Synthesis(_) => TaskKind::Synthesis,
            ModelInput::Transcription(_) => TaskKind::Transcription,
        }
    }
}

/// Output exactly as a backend produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutput {
    Text(String),
    Audio(AudioBuffer),
}

impl RawOutput {
    pub fn kind_name(&self) -> &'static str {
        match self {
            RawOutput::Text(_) => "text",
            RawOutput::Audio(_) => "audio",
        }
    }

    /// Whether this is the kind of output `task` produces.
    pub fn fits(&self, task: TaskKind) -> bool {
        matches!(
            (self, task),
            (RawOutput::Text(_), TaskKind::Translation | TaskKind::Transcription)
                | (RawOutput::Audio(_), TaskKind::Synthesis)
        )
    }
}

/// Post-processed output returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputPayload {
    Text {
        text: String,
    },
    Audio {
        #[serde(skip)]
        wav: Vec<u8>,
        sample_rate: u32,
        duration_secs: f32,
    },
}

impl OutputPayload {
    pub fn text(&self) -> Option<&str> {
        match self {
            OutputPayload::Text { text } => Some(text),
            OutputPayload::Audio { .. } => None,
        }
    }
}

/// Complete pipeline result.
#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub request_id: String,
    pub task: TaskKind,
    pub output: OutputPayload,
    /// Identifier of the backend that served the request
    pub backend: String,
    pub trace: LatencyTrace,
}
