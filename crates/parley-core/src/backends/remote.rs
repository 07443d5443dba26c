//! Hosted-API backend speaking the OpenAI-compatible HTTP surface.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::audio;
use crate::config::{BackendConfig, BackendKind};
use crate::error::{BackendError, Error, Result};
use crate::runtime::types::{
    ModelInput, RawOutput, SynthesisInput, TranscriptionInput, TranslationInput,
};

/// Environment variable holding the token when a backend names none.
pub const DEFAULT_TOKEN_ENV: &str = "HUGGING_FACE_HUB_TOKEN";

const DEFAULT_REMOTE_MODEL: &str = "default";
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RemoteBackend {
    id: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl RemoteBackend {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client,
        })
    }

    /// Build from configuration, reading the token from the environment.
    pub fn from_config(config: &BackendConfig, timeout: Duration) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| Error::Config(format!("remote backend '{}' requires base_url", config.id)))?;
        let token_env = config.api_key_env.as_deref().unwrap_or(DEFAULT_TOKEN_ENV);
        let api_key = std::env::var(token_env).ok();
        if api_key.is_none() {
            debug!("No token in {} for remote backend '{}'", token_env, config.id);
        }

        Self::new(
            config.id.clone(),
            base_url,
            config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_REMOTE_MODEL.to_string()),
            api_key,
            timeout,
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> std::result::Result<reqwest::Response, BackendError> {
        let response = self.authorize(request).send().await.map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::remote(format!(
                "{} returned {}: {}",
                self.id,
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(response)
    }

    async fn translate(&self, input: &TranslationInput) -> std::result::Result<RawOutput, BackendError> {
        let params = &input.params;
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": input.system_prompt },
                { "role": "user", "content": input.text },
            ],
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "top_k": params.top_k,
            "repetition_penalty": params.repeat_penalty,
            "stop": params.stop,
            "seed": params.seed,
        });

        let response = self
            .send(self.client.post(self.url("/v1/chat/completions")).json(&body))
            .await?;
        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| BackendError::remote(format!("invalid completion body: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| RawOutput::Text(c.message.content))
            .ok_or_else(|| BackendError::remote("completion had no choices"))
    }

    async fn synthesize(&self, input: &SynthesisInput) -> std::result::Result<RawOutput, BackendError> {
        let mut body = json!({
            "model": self.model,
            "input": input.text,
            "voice": "default",
            "language": input.language,
            "response_format": "wav",
            "speed": input.params.speed,
        });
        if let Some(reference) = &input.reference {
            let wav = audio::encode_wav(&reference.audio.samples, reference.audio.sample_rate)
                .map_err(|e| BackendError::remote(e.to_string()))?;
            let reference_text = match &reference.text {
                Some(text) => text.clone(),
                None => {
                    debug!("{}: transcribing reference audio", self.id);
                    self.transcribe_wav(wav.clone(), &input.language, 0.0).await?
                }
            };
            body["reference_audio"] = Value::String(audio::base64_encode(&wav));
            body["reference_text"] = Value::String(reference_text);
        }

        let response = self
            .send(self.client.post(self.url("/v1/audio/speech")).json(&body))
            .await?;
        let bytes = response.bytes().await.map_err(classify)?;
        let buffer = audio::decode_wav(&bytes)
            .map_err(|e| BackendError::remote(format!("invalid speech body: {}", e)))?;
        Ok(RawOutput::Audio(buffer))
    }

    async fn transcribe(&self, input: &TranscriptionInput) -> std::result::Result<RawOutput, BackendError> {
        let wav = audio::encode_wav(&input.audio.samples, input.audio.sample_rate)
            .map_err(|e| BackendError::remote(e.to_string()))?;
        let text = self
            .transcribe_wav(wav, &input.language, input.params.temperature)
            .await?;
        Ok(RawOutput::Text(text))
    }

    async fn transcribe_wav(
        &self,
        wav: Vec<u8>,
        language: &str,
        temperature: f32,
    ) -> std::result::Result<String, BackendError> {
        let file = Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| BackendError::remote(e.to_string()))?;
        let form = Form::new()
            .part("file", file)
            .text("model", self.model.clone())
            .text("language", language.to_string())
            .text("temperature", temperature.to_string())
            .text("response_format", "json");

        let response = self
            .send(self.client.post(self.url("/v1/audio/transcriptions")).multipart(form))
            .await?;
        let transcription: Transcription = response
            .json()
            .await
            .map_err(|e| BackendError::remote(format!("invalid transcription body: {}", e)))?;
        Ok(transcription.text.trim().to_string())
    }
}

fn classify(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::timeout(err.to_string())
    } else {
        BackendError::remote(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    text: String,
}

#[async_trait]
impl crate::backends::Backend for RemoteBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn invoke(
        &self,
        input: &ModelInput,
        ctx: &crate::backends::InvokeContext,
    ) -> std::result::Result<RawOutput, BackendError> {
        debug!("Request {} -> remote backend {}", ctx.request_id, self.id);
        match input {
            ModelInput::Translation(t) => self.translate(t).await,
            ModelInput::Synthesis(s) => self.synthesize(s).await,
            ModelInput::Transcription(t) => self.transcribe(t).await,
        }
    }

    async fn health_check(&self) -> std::result::Result<(), BackendError> {
        let request = self
            .client
            .get(self.url("/health"))
            .timeout(HEALTH_PROBE_TIMEOUT);
        self.send(request).await.map(|_| ())
    }
}
