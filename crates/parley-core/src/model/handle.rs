//! Loaded model handles and the traits resident models implement.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::ModelSpec;
use crate::error::{BackendError, Result};
use crate::runtime::types::{ModelInput, RawOutput};
use crate::task::TaskKind;

use super::device::{DevicePlacement, MemoryBudget};

/// Identity of a loaded model: one `Ready` handle per (task, variant).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ModelId {
    pub task: TaskKind,
    pub variant: String,
    pub model: String,
}

impl ModelId {
    pub fn new(task: TaskKind, spec: &ModelSpec) -> Self {
        Self {
            task,
            variant: spec.variant.clone(),
            model: spec.id.clone(),
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.task, self.model, self.variant)
    }
}

/// Cooperative cancellation signal shared with a running device call.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A model resident on a device.
///
/// `generate` is blocking and runs on the blocking pool; implementations may
/// poll `cancel` between steps and bail out early.
pub trait ResidentModel: Send + Sync {
    fn generate(
        &self,
        input: &ModelInput,
        cancel: &CancelFlag,
    ) -> std::result::Result<RawOutput, BackendError>;
}

/// Loads weights for a model spec onto a device.
pub trait ModelLoader: Send + Sync {
    fn load(
        &self,
        task: TaskKind,
        spec: &ModelSpec,
        device: &DevicePlacement,
        budget: &MemoryBudget,
    ) -> Result<Arc<dyn ResidentModel>>;
}

/// Opaque reference to a loaded model and where it lives.
pub struct ModelHandle {
    pub id: ModelId,
    pub device: DevicePlacement,
    pub budget: MemoryBudget,
    ready: AtomicBool,
    model: Option<Arc<dyn ResidentModel>>,
}

impl ModelHandle {
    pub fn new(
        id: ModelId,
        device: DevicePlacement,
        budget: MemoryBudget,
        model: Option<Arc<dyn ResidentModel>>,
    ) -> Self {
        Self {
            id,
            device,
            budget,
            ready: AtomicBool::new(false),
            model,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// The resident model, absent for remote-only deployments.
    pub fn model(&self) -> Option<Arc<dyn ResidentModel>> {
        self.model.clone()
    }

    pub fn has_resident_model(&self) -> bool {
        self.model.is_some()
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("budget", &self.budget)
            .field("ready", &self.is_ready())
            .field("resident", &self.has_resident_model())
            .finish()
    }
}
