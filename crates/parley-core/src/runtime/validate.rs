//! Request validation. Runs before anything touches a backend.

use crate::config::{SynthesisDeployment, ValidationLimits};
use crate::error::{Error, Result};
use crate::task::TaskKind;

use super::types::{InferenceRequest, RequestPayload};

/// Reject requests that violate the deployment's documented constraints.
pub fn validate(
    request: &InferenceRequest,
    task: TaskKind,
    limits: &ValidationLimits,
    synthesis: &SynthesisDeployment,
) -> Result<()> {
    if request.task() != task {
        return Err(Error::Validation(format!(
            "This deployment serves {} requests, not {}",
            task,
            request.task()
        )));
    }

    match &request.payload {
        RequestPayload::Translation { text, .. } => check_text(text, "translation", limits),
        RequestPayload::Synthesis {
            text,
            reference_audio,
            ..
        } => {
            check_text(text, "synthesis", limits)?;
            let has_reference = reference_audio.as_ref().map_or(false, |a| !a.is_empty());
            if synthesis.require_reference_audio && !has_reference {
                return Err(Error::Validation(
                    "Reference audio is required for voice cloning".to_string(),
                ));
            }
            Ok(())
        }
        RequestPayload::Transcription { audio, .. } => {
            if audio.is_empty() {
                return Err(Error::Validation("No audio data provided".to_string()));
            }
            Ok(())
        }
    }
}

fn check_text(text: &str, purpose: &str, limits: &ValidationLimits) -> Result<()> {
    if text.trim().is_empty() {
        return Err(Error::Validation(format!(
            "Empty text provided for {}",
            purpose
        )));
    }
    if text.chars().count() > limits.max_text_chars {
        return Err(Error::Validation(format!(
            "Text exceeds maximum length of {} characters",
            limits.max_text_chars
        )));
    }
    Ok(())
}
