//! Per-request processing: validation, transformation, invocation and
//! post-processing.

pub mod pipeline;
pub mod postprocess;
pub mod transform;
pub mod types;
pub mod validate;

pub use pipeline::{RequestPipeline, SILENCE_BACKEND};
pub use postprocess::PostProcessor;
pub use types::{
    AudioData, InferenceRequest, InferenceResult, ModelInput, OutputPayload, RawOutput,
    RequestPayload,
};
