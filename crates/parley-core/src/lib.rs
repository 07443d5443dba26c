//! Parley core: the model-backed inference service pattern.
//!
//! A deployment loads one model exactly once ([`ServiceLifecycleManager`]),
//! runs every request through a timed validate/transform/invoke/post-process
//! sequence ([`RequestPipeline`]), fails over between interchangeable
//! backends ([`BackendFallbackChain`]) and records per-stage telemetry
//! ([`TelemetryRecorder`]).

pub mod audio;
pub mod backends;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod params;
pub mod runtime;
pub mod task;
pub mod telemetry;

pub use backends::{Backend, BackendDescriptor, BackendFallbackChain, Health, InvokeContext};
pub use config::{ServiceConfig, TtsResponseFormat};
pub use error::{BackendError, BackendErrorKind, Error, Result};
pub use lifecycle::{LifecycleState, ServiceLifecycleManager};
pub use model::{ModelHandle, ModelLoader, ReferenceModelLoader, ResidentModel};
pub use params::TaskParams;
pub use runtime::{
    AudioData, InferenceRequest, InferenceResult, OutputPayload, RawOutput, RequestPipeline,
};
pub use task::TaskKind;
pub use telemetry::{LatencyTrace, TelemetryRecorder, TelemetrySnapshot};
