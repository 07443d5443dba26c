//! Backend that runs the locally resident model.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::BackendKind;
use crate::error::BackendError;
use crate::model::CancelFlag;
use crate::runtime::types::{ModelInput, RawOutput};

use super::{Backend, InvokeContext};

/// Bounds concurrent calls into one resident model.
///
/// A permit is held for the whole device call, including after the caller
/// has given up on it.
#[derive(Debug, Clone)]
pub struct DeviceGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl DeviceGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, BackendError> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BackendError::unavailable("device gate closed"))
    }
}

/// Raises the cancel flag if the awaiting future is dropped before the
/// device call returns.
struct CancelOnDrop {
    flag: CancelFlag,
    armed: bool,
}

impl CancelOnDrop {
    fn new(flag: CancelFlag) -> Self {
        Self { flag, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.flag.cancel();
        }
    }
}

pub struct LocalBackend {
    id: String,
    gate: DeviceGate,
}

impl LocalBackend {
    pub fn new(id: impl Into<String>, gate: DeviceGate) -> Self {
        Self {
            id: id.into(),
            gate,
        }
    }

    pub fn gate(&self) -> &DeviceGate {
        &self.gate
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn invoke(
        &self,
        input: &ModelInput,
        ctx: &InvokeContext,
    ) -> Result<RawOutput, BackendError> {
        let model = ctx
            .handle
            .model()
            .ok_or_else(|| BackendError::unavailable("no resident model loaded"))?;
        if !ctx.handle.is_ready() {
            return Err(BackendError::unavailable("model is not ready"));
        }

        let guard = CancelOnDrop::new(ctx.cancel.clone());
        let permit = self.gate.acquire().await?;
        debug!(
            "Request {} acquired device permit ({} left)",
            ctx.request_id,
            self.gate.available()
        );

        let input = input.clone();
        let cancel = ctx.cancel.clone();
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            model.generate(&input, &cancel)
        })
        .await;
        guard.disarm();

        result.map_err(|e| BackendError::device(format!("device task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelSpec;
    use crate::model::{
        DevicePlacement, MemoryBudget, ModelHandle, ModelId, ResidentModel,
    };
    use crate::params::TranslationParams;
    use crate::runtime::types::TranslationInput;
    use crate::task::TaskKind;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Sleeps in small steps, tracking concurrency and observed cancellation.
    #[derive(Default)]
    struct SlowModel {
        active: AtomicUsize,
        max_active: AtomicUsize,
        saw_cancel: AtomicBool,
        steps: usize,
    }

    impl ResidentModel for SlowModel {
        fn generate(
            &self,
            _input: &ModelInput,
            cancel: &CancelFlag,
        ) -> Result<RawOutput, BackendError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            let mut result = Ok(RawOutput::Text("done".into()));
            for _ in 0..self.steps {
                if cancel.is_cancelled() {
                    self.saw_cancel.store(true, Ordering::SeqCst);
                    result = Err(BackendError::device("cancelled"));
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn handle(model: Arc<SlowModel>) -> Arc<ModelHandle> {
        let handle = ModelHandle::new(
            ModelId::new(TaskKind::Translation, &ModelSpec::default()),
            DevicePlacement::cpu(),
            MemoryBudget::resolve(0.9, 0.95, None).unwrap(),
            Some(model as Arc<dyn ResidentModel>),
        );
        handle.mark_ready();
        Arc::new(handle)
    }

    fn input() -> ModelInput {
        ModelInput::Translation(TranslationInput {
            source_language: "English".into(),
            target_language: "Italian".into(),
            system_prompt: String::new(),
            text: "Hello".into(),
            params: TranslationParams::default(),
        })
    }

    #[tokio::test]
    async fn gate_serializes_device_calls() {
        let model = Arc::new(SlowModel {
            steps: 4,
            ..SlowModel::default()
        });
        let backend = Arc::new(LocalBackend::new("local", DeviceGate::new(1)));
        let handle = handle(model.clone());

        let calls: Vec<_> = (0..4)
            .map(|i| {
                let backend = backend.clone();
                let ctx = InvokeContext::new(format!("req-{i}"), handle.clone());
                tokio::spawn(async move { backend.invoke(&input(), &ctx).await })
            })
            .collect();
        for call in calls {
            assert_eq!(call.await.unwrap().unwrap(), RawOutput::Text("done".into()));
        }

        assert_eq!(model.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(backend.gate().available(), 1);
    }

    #[tokio::test]
    async fn dropped_request_cancels_and_keeps_permit_until_done() {
        let model = Arc::new(SlowModel {
            steps: 200,
            ..SlowModel::default()
        });
        let backend = LocalBackend::new("local", DeviceGate::new(1));
        let ctx = InvokeContext::new("req", handle(model.clone()));

        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), backend.invoke(&input(), &ctx)).await;
        assert!(timed_out.is_err());
        assert!(ctx.cancel.is_cancelled());

        // The device call observes the flag and returns; only then is the
        // permit released.
        for _ in 0..100 {
            if backend.gate().available() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(backend.gate().available(), 1);
        assert!(model.saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn missing_model_is_unavailable() {
        let handle = ModelHandle::new(
            ModelId::new(TaskKind::Translation, &ModelSpec::default()),
            DevicePlacement::cpu(),
            MemoryBudget::resolve(0.9, 0.95, None).unwrap(),
            None,
        );
        let backend = LocalBackend::new("local", DeviceGate::new(1));
        let ctx = InvokeContext::new("req", Arc::new(handle));
        let err = backend.invoke(&input(), &ctx).await.unwrap_err();
        assert_eq!(err.kind, crate::error::BackendErrorKind::Unavailable);
    }
}
