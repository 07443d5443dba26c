//! Application state with backpressure

use parley_core::{InferenceRequest, InferenceResult, RequestPipeline, TaskKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::ApiError;

pub const DEFAULT_MAX_CONCURRENT: usize = 100;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RequestPipeline>,
    /// Concurrency limiter to prevent resource exhaustion
    pub request_semaphore: Arc<Semaphore>,
    /// Overall request timeout (seconds)
    pub request_timeout_secs: u64,
}

impl AppState {
    pub fn new(pipeline: Arc<RequestPipeline>, max_concurrent: usize, request_timeout_secs: u64) -> Self {
        Self {
            pipeline,
            request_semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            request_timeout_secs,
        }
    }

    pub fn task(&self) -> TaskKind {
        self.pipeline.config().task
    }

    /// Acquire a permit for concurrent request processing
    pub async fn acquire_permit(&self) -> Result<SemaphorePermit<'_>, ApiError> {
        self.request_semaphore
            .acquire()
            .await
            .map_err(|_| ApiError::service_unavailable("Server is shutting down"))
    }

    /// Run a request through the pipeline under the global limits.
    pub async fn run(&self, request: InferenceRequest) -> Result<InferenceResult, ApiError> {
        let task = self.task();
        let _permit = self.acquire_permit().await?;

        self.pipeline
            .process_within(request, Duration::from_secs(self.request_timeout_secs))
            .await
            .map_err(|e| ApiError::from_core(e, task))
    }
}
