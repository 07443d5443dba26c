//! Task descriptors and language helpers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// The single task a deployment serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Translation,
    Synthesis,
    Transcription,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Translation => "translation",
            TaskKind::Synthesis => "synthesis",
            TaskKind::Transcription => "transcription",
        }
    }

    /// Prefix used in user-facing failure messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            TaskKind::Translation => "Translation",
            TaskKind::Synthesis => "TTS generation",
            TaskKind::Transcription => "Transcription",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "translation" | "translate" => Ok(TaskKind::Translation),
            "synthesis" | "tts" => Ok(TaskKind::Synthesis),
            "transcription" | "transcribe" | "asr" => Ok(TaskKind::Transcription),
            other => Err(Error::Config(format!("unknown task '{other}'"))),
        }
    }
}

const LANGUAGE_NAMES: &[(&str, &str)] = &[
    ("en", "English"),
    ("es", "Spanish"),
    ("fr", "French"),
    ("de", "German"),
    ("it", "Italian"),
    ("pt", "Portuguese"),
    ("nl", "Dutch"),
    ("pl", "Polish"),
    ("ru", "Russian"),
    ("zh", "Chinese"),
    ("ja", "Japanese"),
    ("ko", "Korean"),
];

/// Resolve an ISO 639-1 code to a human-readable name.
///
/// Unknown codes resolve to English.
pub fn language_name(code: &str) -> &'static str {
    let normalized = code.trim().to_ascii_lowercase();
    LANGUAGE_NAMES
        .iter()
        .find(|(c, _)| *c == normalized)
        .map(|(_, name)| *name)
        .unwrap_or("English")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_codes() {
        assert_eq!(language_name("it"), "Italian");
        assert_eq!(language_name(" ZH "), "Chinese");
    }

    #[test]
    fn unknown_code_falls_back_to_english() {
        assert_eq!(language_name("xx"), "English");
        assert_eq!(language_name(""), "English");
    }

    #[test]
    fn parses_task_aliases() {
        assert_eq!("tts".parse::<TaskKind>().unwrap(), TaskKind::Synthesis);
        assert_eq!("asr".parse::<TaskKind>().unwrap(), TaskKind::Transcription);
        assert!("chat".parse::<TaskKind>().is_err());
    }
}
