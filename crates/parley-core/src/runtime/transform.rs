//! Build model inputs from validated requests.
//!
//! Everything here is a pure function of the request and the parameter
//! bundle: no I/O, no shared state.

use std::f32::consts::PI;

use crate::audio::{self, AudioBuffer};
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::params::TaskParams;
use crate::task::{language_name, TaskKind};

use super::types::{
    AudioData, InferenceRequest, ModelInput, RequestPayload, SynthesisInput, TranscriptionInput,
    TranslationInput, VoiceReference,
};

/// Character lengths of the built-in warmup samples, smallest first.
pub const WARMUP_TEXT_LENGTHS: [usize; 3] = [32, 64, 128];

const WARMUP_SENTENCE: &str = "The quick brown fox jumps over the lazy dog near the river bank. ";
const WARMUP_AUDIO_RATE: u32 = 16000;

pub fn translation_prompt(source_language: &str, target_language: &str) -> String {
    format!(
        "You are a translator. Translate text from {} to {}. Provide only the translation, no explanations.",
        source_language, target_language
    )
}

pub fn transform(request: &InferenceRequest, params: &TaskParams) -> Result<ModelInput> {
    match &request.payload {
        RequestPayload::Translation {
            text,
            source_lang,
            target_lang,
        } => {
            let source_language = language_name(source_lang).to_string();
            let target_language = language_name(target_lang).to_string();
            Ok(ModelInput::Translation(TranslationInput {
                system_prompt: translation_prompt(&source_language, &target_language),
                source_language,
                target_language,
                text: text.trim().to_string(),
                params: params.translation.clone(),
            }))
        }
        RequestPayload::Synthesis {
            text,
            language,
            reference_audio,
            reference_text,
        } => {
            let reference = match reference_audio.as_ref().filter(|a| !a.is_empty()) {
                Some(data) => Some(VoiceReference {
                    audio: decode_audio(data)?,
                    text: reference_text
                        .as_deref()
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string),
                }),
                None => None,
            };
            Ok(ModelInput::Synthesis(SynthesisInput {
                text: text.trim().to_string(),
                language: language.clone(),
                reference,
                params: params.synthesis.clone(),
            }))
        }
        RequestPayload::Transcription { audio, language } => {
            Ok(ModelInput::Transcription(TranscriptionInput {
                audio: decode_audio(audio)?,
                language: language.clone(),
                params: params.transcription.clone(),
            }))
        }
    }
}

fn decode_audio(data: &AudioData) -> Result<AudioBuffer> {
    match data {
        AudioData::Base64(encoded) => audio::decode_wav(&audio::base64_decode(encoded)?),
        AudioData::Bytes(bytes) => audio::decode_wav(bytes),
    }
}

/// Representative inputs of increasing size for the warmup pass.
///
/// Custom texts from the configuration are used when present, ordered by
/// length; otherwise built-in samples of [`WARMUP_TEXT_LENGTHS`] characters.
pub fn warmup_inputs(config: &ServiceConfig) -> Result<Vec<ModelInput>> {
    if !config.warmup.enabled {
        return Ok(Vec::new());
    }

    let mut texts: Vec<String> = config
        .warmup
        .inputs
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if texts.is_empty() {
        texts = WARMUP_TEXT_LENGTHS.iter().map(|len| sample_text(*len)).collect();
    }
    texts.sort_by_key(|t| t.chars().count());

    let requests: Vec<InferenceRequest> = match config.task {
        TaskKind::Translation => texts
            .into_iter()
            .map(|t| InferenceRequest::translation(t, "en", "es"))
            .collect(),
        TaskKind::Synthesis => texts
            .into_iter()
            .map(|t| InferenceRequest::synthesis(t, "en"))
            .collect(),
        TaskKind::Transcription => {
            return Ok([1.0f32, 2.0, 4.0]
                .iter()
                .map(|secs| {
                    ModelInput::Transcription(TranscriptionInput {
                        audio: warmup_tone(*secs),
                        language: "en".to_string(),
                        params: config.params.transcription.clone(),
                    })
                })
                .collect())
        }
    };

    requests
        .iter()
        .map(|r| transform(r, &config.params))
        .collect()
}

fn sample_text(len: usize) -> String {
    WARMUP_SENTENCE.chars().cycle().take(len).collect::<String>().trim().to_string()
}

fn warmup_tone(secs: f32) -> AudioBuffer {
    let total = (secs * WARMUP_AUDIO_RATE as f32) as usize;
    let samples = (0..total)
        .map(|i| 0.1 * (2.0 * PI * 220.0 * i as f32 / WARMUP_AUDIO_RATE as f32).sin())
        .collect();
    AudioBuffer::new(samples, WARMUP_AUDIO_RATE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn translation_input_uses_language_names() {
        let request = InferenceRequest::translation("  Hello  ", "en", "it");
        let input = transform(&request, &TaskParams::default()).unwrap();
        match input {
            ModelInput::Translation(t) => {
                assert_eq!(t.text, "Hello");
                assert_eq!(t.source_language, "English");
                assert_eq!(t.target_language, "Italian");
                assert_eq!(
                    t.system_prompt,
                    "You are a translator. Translate text from English to Italian. Provide only the translation, no explanations."
                );
                assert_eq!(t.params.seed, Some(42));
            }
            other => panic!("unexpected input: {:?}", other),
        }
    }

    #[test]
    fn transform_is_deterministic() {
        let request = InferenceRequest::translation("Hello", "fr", "de");
        let params = TaskParams::default();
        assert_eq!(
            transform(&request, &params).unwrap(),
            transform(&request, &params).unwrap()
        );
    }

    #[test]
    fn transcription_decodes_base64_wav() {
        let wav = audio::encode_wav(&vec![0.0; 1600], 16000).unwrap();
        let request =
            InferenceRequest::transcription(AudioData::Base64(audio::base64_encode(&wav)), "en");
        match transform(&request, &TaskParams::default()).unwrap() {
            ModelInput::Transcription(t) => {
                assert_eq!(t.audio.sample_rate, 16000);
                assert!(t.audio.is_silent());
            }
            other => panic!("unexpected input: {:?}", other),
        }
    }

    #[test]
    fn undecodable_audio_is_an_audio_error() {
        let request = InferenceRequest::transcription(AudioData::Bytes(b"nope".to_vec()), "en");
        assert!(matches!(
            transform(&request, &TaskParams::default()),
            Err(Error::Audio(_))
        ));
    }

    #[test]
    fn warmup_inputs_grow_in_size() {
        let config = ServiceConfig::default();
        let inputs = warmup_inputs(&config).unwrap();
        let lengths: Vec<usize> = inputs
            .iter()
            .map(|i| match i {
                ModelInput::Translation(t) => t.text.len(),
                _ => 0,
            })
            .collect();
        assert_eq!(lengths.len(), 3);
        assert!(lengths.windows(2).all(|w| w[0] < w[1]));

        let mut disabled = ServiceConfig::default();
        disabled.warmup.enabled = false;
        assert!(warmup_inputs(&disabled).unwrap().is_empty());
    }
}
