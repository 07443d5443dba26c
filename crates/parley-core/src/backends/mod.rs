//! Interchangeable model-invocation backends and the fallback chain.

pub mod chain;
pub mod local;
pub mod remote;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::config::BackendKind;
use crate::error::BackendError;
use crate::model::{CancelFlag, ModelHandle};
use crate::runtime::types::{ModelInput, RawOutput};

pub use chain::{BackendFallbackChain, ChainOutcome, Served};
pub use local::{DeviceGate, LocalBackend};
pub use remote::RemoteBackend;

/// Observed health of a backend candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    /// Failed recently; still tried on the next request
    Degraded,
    /// Skipped until a health probe succeeds
    Unavailable,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Health::Healthy => "healthy",
            Health::Degraded => "degraded",
            Health::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// Priority, capability tags and health of one candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendDescriptor {
    pub id: String,
    pub priority: u32,
    pub capabilities: Vec<String>,
    pub health: Health,
}

/// Per-request context handed to every attempt.
#[derive(Debug, Clone)]
pub struct InvokeContext {
    pub request_id: String,
    /// The ready handle obtained from the lifecycle manager
    pub handle: Arc<ModelHandle>,
    /// Raised when the caller goes away or the attempt times out
    pub cancel: CancelFlag,
}

impl InvokeContext {
    pub fn new(request_id: impl Into<String>, handle: Arc<ModelHandle>) -> Self {
        Self {
            request_id: request_id.into(),
            handle,
            cancel: CancelFlag::new(),
        }
    }

    /// Same request, fresh cancellation flag for a new attempt.
    pub fn for_attempt(&self) -> Self {
        Self {
            request_id: self.request_id.clone(),
            handle: self.handle.clone(),
            cancel: CancelFlag::new(),
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Capability tags reported in descriptors.
    fn capabilities(&self) -> Vec<String> {
        let tag = match self.kind() {
            BackendKind::Local => "local",
            BackendKind::Remote => "remote",
        };
        vec![tag.to_string()]
    }

    async fn invoke(
        &self,
        input: &ModelInput,
        ctx: &InvokeContext,
    ) -> Result<RawOutput, BackendError>;

    /// Probe used by the health monitor.
    async fn health_check(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
