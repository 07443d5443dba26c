//! Deterministic reference models.
//!
//! These stand in for real weights so a deployment can be smoke tested end to
//! end. Each is a pure function of its input and parameters.

use std::f32::consts::PI;
use std::sync::Arc;
use tracing::info;

use crate::audio::AudioBuffer;
use crate::config::{ModelSource, ModelSpec};
use crate::error::{BackendError, Error, Result};
use crate::runtime::types::{ModelInput, RawOutput, SynthesisInput, TranscriptionInput};
use crate::task::TaskKind;

use super::device::{DevicePlacement, MemoryBudget};
use super::handle::{CancelFlag, ModelLoader, ResidentModel};

/// Seconds of audio produced per input character.
const SECS_PER_CHAR: f32 = 0.06;
const MIN_SYNTH_SECS: f32 = 0.2;
/// Samples generated between cancellation checks.
const CANCEL_CHECK_STRIDE: usize = 4096;

#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceModelLoader;

impl ModelLoader for ReferenceModelLoader {
    fn load(
        &self,
        task: TaskKind,
        spec: &ModelSpec,
        device: &DevicePlacement,
        budget: &MemoryBudget,
    ) -> Result<Arc<dyn ResidentModel>> {
        if spec.source != ModelSource::Reference {
            return Err(Error::FatalInit(format!(
                "reference loader cannot load model source {:?}",
                spec.source
            )));
        }

        info!(
            "Loading reference {} model '{}' ({}) on {} with {:.0}% memory budget",
            task,
            spec.id,
            spec.variant,
            device.kind,
            budget.fraction * 100.0
        );

        Ok(Arc::new(ReferenceModel { task }))
    }
}

#[derive(Debug)]
pub struct ReferenceModel {
    task: TaskKind,
}

impl ReferenceModel {
    pub fn new(task: TaskKind) -> Self {
        Self { task }
    }

    fn synthesize(
        &self,
        input: &SynthesisInput,
        cancel: &CancelFlag,
    ) -> std::result::Result<RawOutput, BackendError> {
        let params = &input.params;
        let speed = if params.speed > 0.0 { params.speed } else { 1.0 };
        let secs = (input.text.chars().count() as f32 * SECS_PER_CHAR).max(MIN_SYNTH_SECS) / speed;
        let sample_rate = params.sample_rate.max(1);
        let total = (secs * sample_rate as f32).round() as usize;

        let seed = params.seed.unwrap_or(0);
        let frequency = 180.0 + (fnv1a(input.text.as_bytes()) ^ seed) as f32 % 220.0;
        let amplitude = match &input.reference {
            Some(reference) => crate::audio::peak_amplitude(&reference.audio.samples).clamp(0.3, 0.9),
            None => 0.6,
        };

        let mut samples = Vec::with_capacity(total);
        for start in (0..total).step_by(CANCEL_CHECK_STRIDE) {
            if cancel.is_cancelled() {
                return Err(BackendError::device("synthesis cancelled"));
            }
            let end = (start + CANCEL_CHECK_STRIDE).min(total);
            samples.extend((start..end).map(|i| {
                let t = i as f32 / sample_rate as f32;
                amplitude * (2.0 * PI * frequency * t).sin()
            }));
        }

        Ok(RawOutput::Audio(AudioBuffer::new(samples, sample_rate)))
    }

    fn transcribe(&self, input: &TranscriptionInput) -> RawOutput {
        if input.audio.is_silent() {
            return RawOutput::Text(String::new());
        }
        RawOutput::Text(format!(
            "[{:.1}s of {} speech]",
            input.audio.duration_secs(),
            crate::task::language_name(&input.language)
        ))
    }
}

impl ResidentModel for ReferenceModel {
    fn generate(
        &self,
        input: &ModelInput,
        cancel: &CancelFlag,
    ) -> std::result::Result<RawOutput, BackendError> {
        if input.task() != self.task {
            return Err(BackendError::device(format!(
                "{} model cannot serve {} input",
                self.task,
                input.task()
            )));
        }
        if cancel.is_cancelled() {
            return Err(BackendError::device("generation cancelled"));
        }

        match input {
            ModelInput::Translation(t) => Ok(RawOutput::Text(t.text.clone())),
            ModelInput::Synthesis(s) => self.synthesize(s, cancel),
            ModelInput::Transcription(t) => Ok(self.transcribe(t)),
        }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}
