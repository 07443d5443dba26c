//! Validate, transform, invoke, post-process.
//!
//! Each stage is timed. Failures still produce a trace covering the stages
//! that ran, and every request is handed to the telemetry recorder.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::backends::{
    Backend, BackendFallbackChain, DeviceGate, InvokeContext, LocalBackend, RemoteBackend, Served,
};
use crate::config::{BackendKind, ServiceConfig};
use crate::error::{Error, Result};
use crate::lifecycle::ServiceLifecycleManager;
use crate::model::ModelLoader;
use crate::telemetry::{PayloadUnits, Stage, StageClock, TelemetryRecorder};

use super::postprocess::PostProcessor;
use super::transform::transform;
use super::types::{InferenceRequest, InferenceResult, ModelInput, OutputPayload, RawOutput};
use super::validate::validate;

/// Backend id reported when silent audio short-circuits transcription.
pub const SILENCE_BACKEND: &str = "silence";

pub struct RequestPipeline {
    config: Arc<ServiceConfig>,
    lifecycle: ServiceLifecycleManager,
    chain: Arc<BackendFallbackChain>,
    telemetry: Arc<TelemetryRecorder>,
    postprocessor: PostProcessor,
}

impl RequestPipeline {
    pub fn new(
        config: Arc<ServiceConfig>,
        lifecycle: ServiceLifecycleManager,
        chain: Arc<BackendFallbackChain>,
        telemetry: Arc<TelemetryRecorder>,
    ) -> Result<Self> {
        Ok(Self {
            config,
            lifecycle,
            chain,
            telemetry,
            postprocessor: PostProcessor::new()?,
        })
    }

    /// Wire up the lifecycle manager, configured backends and telemetry for
    /// one deployment.
    pub fn from_config(config: Arc<ServiceConfig>, loader: Arc<dyn ModelLoader>) -> Result<Self> {
        config.validate()?;

        let gate = DeviceGate::new(config.device.concurrency);
        let timeout = config.invoke_timeout();
        let mut backends: Vec<(Arc<dyn Backend>, u32)> = Vec::with_capacity(config.backends.len());
        for backend in &config.backends {
            let built: Arc<dyn Backend> = match backend.kind {
                BackendKind::Local => Arc::new(LocalBackend::new(backend.id.clone(), gate.clone())),
                BackendKind::Remote => Arc::new(RemoteBackend::from_config(backend, timeout)?),
            };
            backends.push((built, backend.priority));
        }

        let chain = Arc::new(BackendFallbackChain::new(backends, timeout));
        let lifecycle = ServiceLifecycleManager::new(config.clone(), loader);
        let telemetry = Arc::new(TelemetryRecorder::new(config.task));
        Self::new(config, lifecycle, chain, telemetry)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &ServiceLifecycleManager {
        &self.lifecycle
    }

    pub fn chain(&self) -> &Arc<BackendFallbackChain> {
        &self.chain
    }

    pub fn telemetry(&self) -> &Arc<TelemetryRecorder> {
        &self.telemetry
    }

    /// Run one request through every stage.
    pub async fn process(&self, request: InferenceRequest) -> Result<InferenceResult> {
        let mut clock = StageClock::start();
        let outcome = self.run(&request, &mut clock).await;
        self.finalize(request, clock, outcome).await
    }

    /// Like [`process`](Self::process), but abandon the request once
    /// `deadline` has elapsed. The abandoned request is still recorded, with
    /// the stages completed so far, as a `timeout` failure.
    pub async fn process_within(
        &self,
        request: InferenceRequest,
        deadline: Duration,
    ) -> Result<InferenceResult> {
        let mut clock = StageClock::start();
        let outcome = match tokio::time::timeout(deadline, self.run(&request, &mut clock)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                clock.mark_interrupted();
                Err(Error::Timeout(deadline.as_secs_f64()))
            }
        };
        self.finalize(request, clock, outcome).await
    }

    async fn finalize(
        &self,
        request: InferenceRequest,
        clock: StageClock,
        outcome: Result<(String, OutputPayload, PayloadUnits)>,
    ) -> Result<InferenceResult> {
        let trace = clock.finish();

        match outcome {
            Ok((backend, output, units)) => {
                self.telemetry
                    .record_success(&request.id, &trace, &backend, units)
                    .await;
                debug!(
                    "Request {} served by {} in {:.3}s",
                    request.id,
                    backend,
                    trace.total().as_secs_f64()
                );
                Ok(InferenceResult {
                    request_id: request.id,
                    task: self.config.task,
                    output,
                    backend,
                    trace,
                })
            }
            Err(err) => {
                self.telemetry
                    .record_failure(&request.id, &trace, err.kind_name())
                    .await;
                debug!("Request {} failed: {}", request.id, err);
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        request: &InferenceRequest,
        clock: &mut StageClock,
    ) -> Result<(String, OutputPayload, PayloadUnits)> {
        let task = self.config.task;

        let validated = validate(request, task, &self.config.limits, &self.config.synthesis);
        clock.mark(Stage::Validate);
        validated?;

        let input = transform(request, &self.config.params);
        clock.mark(Stage::Transform);
        let input = input?;
        let input_audio_secs = match &input {
            ModelInput::Transcription(t) => Some(t.audio.duration_secs() as f64),
            _ => None,
        };

        let served = self.invoke(request, &input, clock).await;
        clock.mark(Stage::Invoke);
        let served = served?;

        let output = self
            .postprocessor
            .process(task, served.output, &self.config.params);
        clock.mark(Stage::PostProcess);
        let output = output?;

        let units = match (&output, input_audio_secs) {
            (_, Some(secs)) => PayloadUnits::audio_input(secs),
            (OutputPayload::Audio { duration_secs, .. }, None) => {
                PayloadUnits::audio_output(*duration_secs as f64)
            }
            (OutputPayload::Text { text }, None) => PayloadUnits::chars(text.chars().count()),
        };

        Ok((served.backend, output, units))
    }

    async fn invoke(
        &self,
        request: &InferenceRequest,
        input: &ModelInput,
        clock: &mut StageClock,
    ) -> Result<Served> {
        if let ModelInput::Transcription(t) = input {
            if t.audio.is_silent() {
                debug!("Request {}: silent audio, skipping backends", request.id);
                return Ok(Served {
                    backend: SILENCE_BACKEND.to_string(),
                    output: RawOutput::Text(String::new()),
                });
            }
        }

        let handle = self.lifecycle.get_handle().await?;
        let ctx = InvokeContext::new(request.id.clone(), handle);
        let outcome = self.chain.invoke(input, &ctx).await;
        clock.record_attempts(outcome.attempts);
        outcome.result
    }
}
