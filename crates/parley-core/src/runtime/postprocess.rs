//! Output cleanup, applied the same way whichever backend answered.
//!
//! Text rules, in order:
//! 1. drop echoed instruction/tag markup (`<s>`, `</s>`, `[INST]`, `[/INST]`,
//!    `<<SYS>>`, `<</SYS>>`, `<|...|>` special tokens);
//! 2. translations only: drop parenthetical asides together with the
//!    whitespace before them;
//! 3. trim whitespace, then strip enclosing quote characters
//!    (`"`, `'`, `“`, `”`, `«`, `»`) and trim again.
//!
//! Audio is scaled so its peak never exceeds the configured limit, then
//! encoded as 16-bit mono WAV.

use regex::Regex;

use crate::audio::{self, AudioBuffer};
use crate::error::{BackendError, Error, Result};
use crate::params::TaskParams;
use crate::task::TaskKind;

use super::types::{OutputPayload, RawOutput};

const MARKUP_PATTERN: &str = r"</?s>|\[/?INST\]|<</?SYS>>|<\|[^|>]*\|>";
const PARENTHETICAL_PATTERN: &str = r"\s*\([^)]*\)";

#[derive(Debug, Clone)]
pub struct PostProcessor {
    markup: Regex,
    parenthetical: Regex,
}

impl PostProcessor {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| Error::Config(format!("invalid cleanup rule: {}", e)))
        };
        Ok(Self {
            markup: compile(MARKUP_PATTERN)?,
            parenthetical: compile(PARENTHETICAL_PATTERN)?,
        })
    }

    pub fn process(&self, task: TaskKind, raw: RawOutput, params: &TaskParams) -> Result<OutputPayload> {
        match (task, raw) {
            (TaskKind::Translation, RawOutput::Text(text)) => Ok(OutputPayload::Text {
                text: self.clean_translation(&text),
            }),
            (TaskKind::Transcription, RawOutput::Text(text)) => Ok(OutputPayload::Text {
                text: self.clean_transcription(&text),
            }),
            (TaskKind::Synthesis, RawOutput::Audio(buffer)) => {
                encode_audio(buffer, params.synthesis.peak_limit)
            }
            (task, raw) => Err(Error::Backend(BackendError::remote(format!(
                "backend returned {} output for a {} request",
                raw.kind_name(),
                task
            )))),
        }
    }

    pub fn clean_translation(&self, text: &str) -> String {
        let text = self.markup.replace_all(text, "");
        let text = self.parenthetical.replace_all(&text, "");
        strip_quotes(&text)
    }

    pub fn clean_transcription(&self, text: &str) -> String {
        let text = self.markup.replace_all(text, "");
        strip_quotes(&text)
    }
}

fn strip_quotes(text: &str) -> String {
    text.trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '“' | '”' | '«' | '»'))
        .trim()
        .to_string()
}

fn encode_audio(mut buffer: AudioBuffer, peak_limit: f32) -> Result<OutputPayload> {
    audio::normalize_peak(&mut buffer.samples, peak_limit);
    let wav = audio::encode_wav(&buffer.samples, buffer.sample_rate)?;
    Ok(OutputPayload::Audio {
        wav,
        sample_rate: buffer.sample_rate,
        duration_secs: buffer.duration_secs(),
    })
}
