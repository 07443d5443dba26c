//! Per-task generation parameters.
//!
//! One structure per task, enumerating every option a backend honours. A
//! deployment builds them once at startup; each request receives a shared
//! immutable reference.

use serde::{Deserialize, Serialize};

/// Parameters for chat-style translation generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationParams {
    /// Upper bound on generated tokens
    #[serde(default = "default_translation_max_tokens")]
    pub max_tokens: usize,

    /// Sampling temperature (0.0 = greedy)
    #[serde(default = "default_translation_temperature")]
    pub temperature: f32,

    /// Nucleus sampling threshold
    #[serde(default = "default_translation_top_p")]
    pub top_p: f32,

    /// Top-k sampling (0 = disabled)
    #[serde(default = "default_translation_top_k")]
    pub top_k: usize,

    /// Penalty applied to repeated tokens
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    /// Generation stops at the first of these sequences
    #[serde(default = "default_stop")]
    pub stop: Vec<String>,

    /// Sampling seed; fixes output for a given input when set
    #[serde(default = "default_seed")]
    pub seed: Option<u64>,
}

fn default_translation_max_tokens() -> usize {
    512
}
fn default_translation_temperature() -> f32 {
    0.3
}
fn default_translation_top_p() -> f32 {
    0.95
}
fn default_translation_top_k() -> usize {
    40
}
fn default_repeat_penalty() -> f32 {
    1.2
}
fn default_stop() -> Vec<String> {
    vec!["</s>".to_string()]
}
fn default_seed() -> Option<u64> {
    Some(42)
}

impl Default for TranslationParams {
    fn default() -> Self {
        Self {
            max_tokens: default_translation_max_tokens(),
            temperature: default_translation_temperature(),
            top_p: default_translation_top_p(),
            top_k: default_translation_top_k(),
            repeat_penalty: default_repeat_penalty(),
            stop: default_stop(),
            seed: default_seed(),
        }
    }
}

impl TranslationParams {
    pub fn is_deterministic(&self) -> bool {
        self.temperature <= 0.0 || self.seed.is_some()
    }
}

/// Parameters for speech synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisParams {
    /// Output sample rate (Hz)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Speed factor (1.0 = normal)
    #[serde(default = "default_speed")]
    pub speed: f32,

    /// Sampling temperature
    #[serde(default = "default_synthesis_temperature")]
    pub temperature: f32,

    #[serde(default = "default_seed")]
    pub seed: Option<u64>,

    /// Peak amplitude the post-processor normalizes down to
    #[serde(default = "default_peak_limit")]
    pub peak_limit: f32,
}

fn default_sample_rate() -> u32 {
    24000
}
fn default_speed() -> f32 {
    1.0
}
fn default_synthesis_temperature() -> f32 {
    0.7
}
fn default_peak_limit() -> f32 {
    0.95
}

impl Default for SynthesisParams {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            speed: default_speed(),
            temperature: default_synthesis_temperature(),
            seed: default_seed(),
            peak_limit: default_peak_limit(),
        }
    }
}

/// Parameters for chunked speech recognition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionParams {
    /// Length of each recognition window (seconds)
    #[serde(default = "default_chunk_length_secs")]
    pub chunk_length_secs: u32,

    /// Overlap between consecutive windows (seconds)
    #[serde(default = "default_stride_length_secs")]
    pub stride_length_secs: u32,

    /// Windows decoded per device call
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_return_timestamps")]
    pub return_timestamps: bool,

    #[serde(default)]
    pub temperature: f32,
}

fn default_chunk_length_secs() -> u32 {
    30
}
fn default_stride_length_secs() -> u32 {
    5
}
fn default_batch_size() -> usize {
    8
}
fn default_return_timestamps() -> bool {
    true
}

impl Default for TranscriptionParams {
    fn default() -> Self {
        Self {
            chunk_length_secs: default_chunk_length_secs(),
            stride_length_secs: default_stride_length_secs(),
            batch_size: default_batch_size(),
            return_timestamps: default_return_timestamps(),
            temperature: 0.0,
        }
    }
}

/// The immutable parameter bundle handed to every invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    #[serde(default)]
    pub translation: TranslationParams,
    #[serde(default)]
    pub synthesis: SynthesisParams,
    #[serde(default)]
    pub transcription: TranscriptionParams,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_documented_defaults() {
        let params: TaskParams =
            serde_json::from_str(r#"{"translation": {"temperature": 0.0, "seed": null}}"#).unwrap();
        assert_eq!(params.translation.temperature, 0.0);
        assert_eq!(params.translation.max_tokens, 512);
        assert_eq!(params.translation.stop, vec!["</s>".to_string()]);
        assert!(params.translation.is_deterministic());
        assert_eq!(params.synthesis.sample_rate, 24000);
        assert_eq!(params.transcription.chunk_length_secs, 30);
    }
}
