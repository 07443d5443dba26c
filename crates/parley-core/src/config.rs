//! Configuration types for a parley deployment.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};
use crate::params::TaskParams;
use crate::task::TaskKind;

/// Main service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// The one task this deployment serves
    #[serde(default = "default_task")]
    pub task: TaskKind,

    /// Model identity and weight source
    #[serde(default)]
    pub model: ModelSpec,

    /// Device placement and memory budget
    #[serde(default)]
    pub device: DeviceConfig,

    /// Request validation limits
    #[serde(default)]
    pub limits: ValidationLimits,

    /// How requests behave while the model is still loading
    #[serde(default)]
    pub readiness: ReadinessConfig,

    /// Timeout applied to every individual backend attempt (seconds)
    #[serde(default = "default_invoke_timeout_secs")]
    pub invoke_timeout_secs: u64,

    /// Backend candidates; lower priority values are tried first
    #[serde(default = "default_backends")]
    pub backends: Vec<BackendConfig>,

    /// Per-task generation parameters
    #[serde(default)]
    pub params: TaskParams,

    /// Speech synthesis deployment options
    #[serde(default)]
    pub synthesis: SynthesisDeployment,

    /// Warmup pass run before traffic is admitted
    #[serde(default)]
    pub warmup: WarmupConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            task: default_task(),
            model: ModelSpec::default(),
            device: DeviceConfig::default(),
            limits: ValidationLimits::default(),
            readiness: ReadinessConfig::default(),
            invoke_timeout_secs: default_invoke_timeout_secs(),
            backends: default_backends(),
            params: TaskParams::default(),
            synthesis: SynthesisDeployment::default(),
            warmup: WarmupConfig::default(),
        }
    }
}

fn default_task() -> TaskKind {
    TaskKind::Translation
}

fn default_invoke_timeout_secs() -> u64 {
    120
}

fn default_backends() -> Vec<BackendConfig> {
    vec![BackendConfig {
        id: "local".to_string(),
        priority: 0,
        kind: BackendKind::Local,
        base_url: None,
        model: None,
        api_key_env: None,
    }]
}

/// Where the resident model's weights come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    /// Deterministic built-in reference model
    Reference,
    /// No resident model; remote-only deployment
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model identifier (repository id or local name)
    #[serde(default = "default_model_id")]
    pub id: String,

    /// Variant within the model family (quantization, size)
    #[serde(default = "default_model_variant")]
    pub variant: String,

    #[serde(default = "default_model_source")]
    pub source: ModelSource,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            id: default_model_id(),
            variant: default_model_variant(),
            source: default_model_source(),
        }
    }
}

fn default_model_id() -> String {
    "parley/reference".to_string()
}

fn default_model_variant() -> String {
    "default".to_string()
}

fn default_model_source() -> ModelSource {
    ModelSource::Reference
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// `cpu`, `cuda`, `cuda:N` or `metal`
    #[serde(default = "default_placement")]
    pub placement: String,

    /// Total accelerator memory, when known (MiB)
    #[serde(default)]
    pub total_memory_mb: Option<u64>,

    /// Fraction of device memory this process may reserve
    #[serde(default = "default_memory_fraction")]
    pub memory_fraction: f64,

    /// Hard ceiling on the fraction, whatever was requested
    #[serde(default = "default_memory_ceiling")]
    pub memory_ceiling: f64,

    /// Concurrent device calls allowed against one resident model
    #[serde(default = "default_device_concurrency")]
    pub concurrency: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            placement: default_placement(),
            total_memory_mb: None,
            memory_fraction: default_memory_fraction(),
            memory_ceiling: default_memory_ceiling(),
            concurrency: default_device_concurrency(),
        }
    }
}

fn default_placement() -> String {
    "cpu".to_string()
}

fn default_memory_fraction() -> f64 {
    0.9
}

fn default_memory_ceiling() -> f64 {
    0.95
}

fn default_device_concurrency() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationLimits {
    /// Maximum text payload length, in characters
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_text_chars: default_max_text_chars(),
        }
    }
}

fn default_max_text_chars() -> usize {
    1000
}

/// Behaviour of `get_handle` while the model is loading or warming up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessPolicy {
    /// Suspend the caller until ready; `ServiceUnavailable` past the timeout
    Wait,
    /// Fail immediately with `NotReady`
    FailFast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitMode {
    /// Load and warm up before the listener binds
    Eager,
    /// Load on the first request
    Lazy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    #[serde(default = "default_readiness_policy")]
    pub policy: ReadinessPolicy,

    #[serde(default = "default_readiness_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_init_mode")]
    pub init_mode: InitMode,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            policy: default_readiness_policy(),
            timeout_secs: default_readiness_timeout_secs(),
            init_mode: default_init_mode(),
        }
    }
}

impl ReadinessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_readiness_policy() -> ReadinessPolicy {
    ReadinessPolicy::Wait
}

fn default_readiness_timeout_secs() -> u64 {
    60
}

fn default_init_mode() -> InitMode {
    InitMode::Eager
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Identifier reported in results and telemetry
    pub id: String,

    #[serde(default)]
    pub priority: u32,

    pub kind: BackendKind,

    /// Base URL of the hosted API (remote only)
    #[serde(default)]
    pub base_url: Option<String>,

    /// Model name sent to the hosted API (remote only)
    #[serde(default)]
    pub model: Option<String>,

    /// Environment variable holding the API token (remote only).
    /// Defaults to `HUGGING_FACE_HUB_TOKEN`.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

/// Response container for `/tts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsResponseFormat {
    /// Raw `audio/wav` bytes
    Raw,
    /// `{audio, duration, sample_rate}` JSON envelope
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisDeployment {
    /// Voice-cloning deployments reject requests without reference audio
    #[serde(default)]
    pub require_reference_audio: bool,

    #[serde(default = "default_tts_response")]
    pub response: TtsResponseFormat,
}

impl Default for SynthesisDeployment {
    fn default() -> Self {
        Self {
            require_reference_audio: false,
            response: default_tts_response(),
        }
    }
}

fn default_tts_response() -> TtsResponseFormat {
    TtsResponseFormat::Raw
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupConfig {
    #[serde(default = "default_warmup_enabled")]
    pub enabled: bool,

    /// Custom warmup texts; built-in samples are used when empty
    #[serde(default)]
    pub inputs: Vec<String>,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            enabled: default_warmup_enabled(),
            inputs: Vec::new(),
        }
    }
}

fn default_warmup_enabled() -> bool {
    true
}

impl ServiceConfig {
    /// Load configuration from a JSON file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&contents).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Apply `PARLEY_*` environment overrides. Invalid values are logged and
    /// ignored.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup("PARLEY_TASK") {
            match raw.parse::<TaskKind>() {
                Ok(task) => self.task = task,
                Err(_) => warn!("Invalid PARLEY_TASK='{}', keeping {}", raw, self.task),
            }
        }

        if let Some(raw) = lookup("PARLEY_DEVICE") {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                self.device.placement = trimmed.to_string();
            }
        }

        if let Some(raw) = lookup("PARLEY_DEVICE_MEMORY_FRACTION") {
            match raw.trim().parse::<f64>() {
                Ok(fraction) => self.device.memory_fraction = fraction,
                Err(_) => warn!(
                    "Invalid PARLEY_DEVICE_MEMORY_FRACTION='{}', keeping {}",
                    raw, self.device.memory_fraction
                ),
            }
        }

        if let Some(raw) = lookup("PARLEY_MAX_TEXT_CHARS") {
            match raw.trim().parse::<usize>() {
                Ok(max) if max > 0 => self.limits.max_text_chars = max,
                _ => warn!(
                    "Invalid PARLEY_MAX_TEXT_CHARS='{}', keeping {}",
                    raw, self.limits.max_text_chars
                ),
            }
        }

        if let Some(raw) = lookup("PARLEY_INVOKE_TIMEOUT_SECS") {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => self.invoke_timeout_secs = secs,
                _ => warn!(
                    "Invalid PARLEY_INVOKE_TIMEOUT_SECS='{}', keeping {}",
                    raw, self.invoke_timeout_secs
                ),
            }
        }
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.invoke_timeout_secs)
    }

    /// Reject configurations that cannot serve a single request.
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(Error::Config("at least one backend is required".into()));
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.id.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate backend id '{}'",
                    backend.id
                )));
            }
            match backend.kind {
                BackendKind::Remote => {
                    let has_url = backend
                        .base_url
                        .as_deref()
                        .map(|u| !u.trim().is_empty())
                        .unwrap_or(false);
                    if !has_url {
                        return Err(Error::Config(format!(
                            "remote backend '{}' requires base_url",
                            backend.id
                        )));
                    }
                }
                BackendKind::Local => {
                    if self.model.source == ModelSource::None {
                        return Err(Error::Config(format!(
                            "local backend '{}' configured but model.source is none",
                            backend.id
                        )));
                    }
                }
            }
        }

        let fraction = self.device.memory_fraction;
        if !fraction.is_finite() || fraction <= 0.0 || fraction > 1.0 {
            return Err(Error::Config(format!(
                "device memory fraction must be in (0, 1], got {}",
                fraction
            )));
        }

        if self.device.concurrency == 0 {
            return Err(Error::Config("device concurrency must be at least 1".into()));
        }

        Ok(())
    }

    pub fn has_local_backend(&self) -> bool {
        self.backends.iter().any(|b| b.kind == BackendKind::Local)
    }
}
