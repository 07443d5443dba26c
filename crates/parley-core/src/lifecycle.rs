//! One-time model load, warmup and readiness.
//!
//! The manager walks `Uninitialized -> Loading -> WarmingUp -> Ready`. Any
//! unrecoverable error moves it to `Failed`, which is terminal. Concurrent
//! callers of [`ServiceLifecycleManager::initialize`] and
//! [`ServiceLifecycleManager::warmup`] share a single in-flight operation.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{watch, OnceCell};
use tracing::{error, info, warn};

use crate::config::{InitMode, ModelSource, ReadinessPolicy, ServiceConfig};
use crate::error::{Error, Result};
use crate::model::{
    CancelFlag, DevicePlacement, MemoryBudget, ModelHandle, ModelId, ModelLoader,
};
use crate::runtime::transform::warmup_inputs;
use crate::runtime::types::{ModelInput, RawOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Loading,
    WarmingUp,
    Ready,
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Loading => "loading",
            LifecycleState::WarmingUp => "warming_up",
            LifecycleState::Ready => "ready",
            LifecycleState::Failed => "failed",
        }
    }

    fn is_settled(&self) -> bool {
        matches!(self, LifecycleState::Ready | LifecycleState::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct LifecycleInner {
    config: Arc<ServiceConfig>,
    loader: Arc<dyn ModelLoader>,
    state: watch::Sender<LifecycleState>,
    handle: OnceCell<Arc<ModelHandle>>,
    warmed: OnceCell<()>,
    failure: Mutex<Option<String>>,
    lazy_started: AtomicBool,
    loads: AtomicUsize,
}

/// Owns the model handle for the lifetime of the process.
#[derive(Clone)]
pub struct ServiceLifecycleManager {
    inner: Arc<LifecycleInner>,
}

impl ServiceLifecycleManager {
    pub fn new(config: Arc<ServiceConfig>, loader: Arc<dyn ModelLoader>) -> Self {
        let (state, _) = watch::channel(LifecycleState::Uninitialized);
        Self {
            inner: Arc::new(LifecycleInner {
                config,
                loader,
                state,
                handle: OnceCell::new(),
                warmed: OnceCell::new(),
                failure: Mutex::new(None),
                lazy_started: AtomicBool::new(false),
                loads: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    /// Why the manager entered `Failed`, if it did.
    pub fn failure_reason(&self) -> Option<String> {
        self.inner.failure.lock().ok().and_then(|f| f.clone())
    }

    /// Number of model loads performed; never exceeds one.
    pub fn load_count(&self) -> usize {
        self.inner.loads.load(Ordering::SeqCst)
    }

    /// Load the model onto the configured device within its memory budget.
    ///
    /// Concurrent calls collapse into one load. A load error is fatal: the
    /// manager enters `Failed` and the error is `FatalInit`.
    pub async fn initialize(&self) -> Result<Arc<ModelHandle>> {
        if let Some(handle) = self.inner.handle.get() {
            return Ok(handle.clone());
        }
        self.ensure_not_failed()?;

        let handle = self
            .inner
            .handle
            .get_or_try_init::<Error, _, _>(|| async {
                self.ensure_not_failed()?;
                self.transition(LifecycleState::Loading);
                match self.load().await {
                    Ok(handle) => Ok(Arc::new(handle)),
                    Err(e) => Err(self.fail(e)),
                }
            })
            .await?;

        Ok(handle.clone())
    }

    async fn load(&self) -> Result<ModelHandle> {
        let config = &self.inner.config;
        let device = DevicePlacement::from_config(&config.device)?;
        let budget = MemoryBudget::from_config(&config.device, &device)?;
        let id = ModelId::new(config.task, &config.model);

        let needs_resident = config.has_local_backend() && config.model.source != ModelSource::None;
        if !needs_resident {
            info!("No local backend configured; {} runs remote-only", id);
            return Ok(ModelHandle::new(id, device, budget, None));
        }

        info!(
            "Loading model {} on {} (memory fraction {:.2})",
            id, device.kind, budget.fraction
        );
        let started = Instant::now();
        self.inner.loads.fetch_add(1, Ordering::SeqCst);

        let model = {
            let loader = self.inner.loader.clone();
            let task = config.task;
            let spec = config.model.clone();
            let device = device.clone();
            let budget = budget.clone();
            tokio::task::spawn_blocking(move || loader.load(task, &spec, &device, &budget))
                .await
                .map_err(|e| Error::FatalInit(format!("model load task failed: {}", e)))??
        };

        info!("Model {} loaded in {:.2}s", id, started.elapsed().as_secs_f64());
        Ok(ModelHandle::new(id, device, budget, Some(model)))
    }

    /// Run `samples` through the model and mark the handle ready.
    ///
    /// Initializes first if needed. Idempotent: once `Ready`, further calls
    /// return immediately without touching the model.
    pub async fn warmup(&self, samples: Vec<ModelInput>) -> Result<()> {
        let handle = self.initialize().await?;

        self.inner
            .warmed
            .get_or_try_init::<Error, _, _>(|| async {
                self.ensure_not_failed()?;
                self.transition(LifecycleState::WarmingUp);
                if let Err(e) = run_warmup(&handle, samples).await {
                    return Err(self.fail(e));
                }
                handle.mark_ready();
                self.transition(LifecycleState::Ready);
                info!("Model {} ready", handle.id);
                Ok(())
            })
            .await?;

        Ok(())
    }

    /// Initialize and warm up with the configured warmup inputs.
    pub async fn start(&self) -> Result<Arc<ModelHandle>> {
        let handle = self.initialize().await?;
        let samples = warmup_inputs(&self.inner.config).map_err(|e| self.fail(e))?;
        self.warmup(samples).await?;
        Ok(handle)
    }

    /// The ready handle.
    ///
    /// While loading or warming up, `wait` policy suspends the caller until
    /// ready (`ServiceUnavailable` past the readiness timeout) and
    /// `fail_fast` returns `NotReady`. In lazy mode the first call starts
    /// initialization in the background.
    pub async fn get_handle(&self) -> Result<Arc<ModelHandle>> {
        if self.state() == LifecycleState::Ready {
            if let Some(handle) = self.inner.handle.get() {
                return Ok(handle.clone());
            }
        }

        let readiness = &self.inner.config.readiness;
        if readiness.init_mode == InitMode::Lazy
            && !self.inner.lazy_started.swap(true, Ordering::SeqCst)
        {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.start().await {
                    error!("Lazy model initialization failed: {}", e);
                }
            });
        }

        let state = self.state();
        if state == LifecycleState::Failed {
            return Err(self.unavailable());
        }
        if readiness.policy == ReadinessPolicy::FailFast {
            return Err(Error::NotReady(format!("model is {}", state)));
        }

        let mut rx = self.subscribe();
        let settled = tokio::time::timeout(readiness.timeout(), async {
            rx.wait_for(|s| s.is_settled()).await.map(|s| *s)
        })
        .await;

        match settled {
            Ok(Ok(LifecycleState::Ready)) => self
                .inner
                .handle
                .get()
                .cloned()
                .ok_or_else(|| Error::ServiceUnavailable("model handle missing".into())),
            Ok(Ok(_)) => Err(self.unavailable()),
            Ok(Err(_)) => Err(Error::ServiceUnavailable("lifecycle closed".into())),
            Err(_) => {
                warn!(
                    "Model not ready after {}s (state: {})",
                    readiness.timeout_secs,
                    self.state()
                );
                Err(Error::ServiceUnavailable(format!(
                    "model not ready after {}s",
                    readiness.timeout_secs
                )))
            }
        }
    }

    fn unavailable(&self) -> Error {
        Error::ServiceUnavailable(
            self.failure_reason()
                .unwrap_or_else(|| "model initialization failed".to_string()),
        )
    }

    fn ensure_not_failed(&self) -> Result<()> {
        if self.state() == LifecycleState::Failed {
            return Err(Error::FatalInit(
                self.failure_reason()
                    .unwrap_or_else(|| "model initialization failed".to_string()),
            ));
        }
        Ok(())
    }

    /// Move forward unless already `Failed`.
    fn transition(&self, next: LifecycleState) {
        self.inner.state.send_if_modified(|state| {
            if *state == LifecycleState::Failed || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    fn fail(&self, err: Error) -> Error {
        let reason = match err {
            Error::FatalInit(msg) => msg,
            other => other.to_string(),
        };
        error!("Model initialization failed: {}", reason);
        if let Ok(mut failure) = self.inner.failure.lock() {
            failure.get_or_insert_with(|| reason.clone());
        }
        self.inner.state.send_replace(LifecycleState::Failed);
        Error::FatalInit(reason)
    }
}

async fn run_warmup(handle: &Arc<ModelHandle>, samples: Vec<ModelInput>) -> Result<()> {
    let Some(model) = handle.model() else {
        return Ok(());
    };

    let total = samples.len();
    for (i, input) in samples.into_iter().enumerate() {
        let units = input_units(&input);
        let started = Instant::now();
        let model = model.clone();
        let output = tokio::task::spawn_blocking(move || {
            model.generate(&input, &CancelFlag::new())
        })
        .await
        .map_err(|e| Error::FatalInit(format!("warmup task failed: {}", e)))?
        .map_err(|e| Error::FatalInit(format!("warmup generation failed: {}", e)))?;

        let elapsed = started.elapsed().as_secs_f64();
        let (amount, unit) = match output {
            RawOutput::Audio(audio) => (audio.duration_secs() as f64, "audio s"),
            RawOutput::Text(_) => units,
        };
        let rate = if elapsed > 0.0 { amount / elapsed } else { 0.0 };
        info!(
            "Warmup {}/{}: {:.1} {} in {:.3}s ({:.1} {}/s)",
            i + 1,
            total,
            amount,
            unit,
            elapsed,
            rate,
            unit
        );
    }
    Ok(())
}

fn input_units(input: &ModelInput) -> (f64, &'static str) {
    match input {
        ModelInput::Translation(t) => (t.text.chars().count() as f64, "chars"),
        ModelInput::Synthesis(s) => (s.text.chars().count() as f64, "chars"),
        ModelInput::Transcription(t) => (t.audio.duration_secs() as f64, "audio s"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelSpec;
    use crate::error::BackendError;
    use crate::model::{ReferenceModelLoader, ResidentModel};
    use crate::task::TaskKind;
    use std::time::Duration;

    /// Counts loads and blocks for a while to widen race windows.
    struct SlowLoader {
        delay: Duration,
        fail: bool,
        loads: AtomicUsize,
    }

    impl SlowLoader {
        fn new(delay_ms: u64, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::from_millis(delay_ms),
                fail,
                loads: AtomicUsize::new(0),
            })
        }
    }

    impl ModelLoader for SlowLoader {
        fn load(
            &self,
            task: TaskKind,
            spec: &ModelSpec,
            device: &DevicePlacement,
            budget: &MemoryBudget,
        ) -> Result<Arc<dyn ResidentModel>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(Error::FatalInit("weights missing".into()));
            }
            ReferenceModelLoader.load(task, spec, device, budget)
        }
    }

    struct BrokenModel;

    impl ResidentModel for BrokenModel {
        fn generate(
            &self,
            _input: &ModelInput,
            _cancel: &CancelFlag,
        ) -> std::result::Result<RawOutput, BackendError> {
            Err(BackendError::device("out of memory"))
        }
    }

    struct BrokenLoader;

    impl ModelLoader for BrokenLoader {
        fn load(
            &self,
            _task: TaskKind,
            _spec: &ModelSpec,
            _device: &DevicePlacement,
            _budget: &MemoryBudget,
        ) -> Result<Arc<dyn ResidentModel>> {
            Ok(Arc::new(BrokenModel))
        }
    }

    fn manager(config: ServiceConfig, loader: Arc<dyn ModelLoader>) -> ServiceLifecycleManager {
        ServiceLifecycleManager::new(Arc::new(config), loader)
    }

    #[tokio::test]
    async fn warmup_twice_loads_once() {
        let loader = SlowLoader::new(10, false);
        let lifecycle = manager(ServiceConfig::default(), loader.clone());

        lifecycle.warmup(warmup_inputs(lifecycle.config()).unwrap()).await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Ready);
        lifecycle.warmup(warmup_inputs(lifecycle.config()).unwrap()).await.unwrap();

        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.load_count(), 1);
        assert!(lifecycle.get_handle().await.unwrap().is_ready());
    }

    #[tokio::test]
    async fn concurrent_initialization_collapses() {
        let loader = SlowLoader::new(50, false);
        let lifecycle = manager(ServiceConfig::default(), loader.clone());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let lifecycle = lifecycle.clone();
                tokio::spawn(async move { lifecycle.start().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.state(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn load_failure_is_fatal_and_terminal() {
        let loader = SlowLoader::new(0, true);
        let lifecycle = manager(ServiceConfig::default(), loader.clone());

        let err = lifecycle.start().await.unwrap_err();
        assert!(matches!(err, Error::FatalInit(_)));
        assert_eq!(lifecycle.state(), LifecycleState::Failed);

        // No transition leaves Failed, and no second load is attempted.
        assert!(lifecycle.initialize().await.is_err());
        assert!(lifecycle.warmup(Vec::new()).await.is_err());
        assert_eq!(lifecycle.state(), LifecycleState::Failed);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);

        let err = lifecycle.get_handle().await.unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable(_)));
        assert!(lifecycle.failure_reason().unwrap().contains("weights missing"));
    }

    #[tokio::test]
    async fn warmup_failure_moves_to_failed() {
        let lifecycle = manager(ServiceConfig::default(), Arc::new(BrokenLoader));
        assert!(lifecycle.start().await.is_err());
        assert_eq!(lifecycle.state(), LifecycleState::Failed);
    }

    #[tokio::test]
    async fn get_handle_waits_for_ready() {
        let loader = SlowLoader::new(100, false);
        let lifecycle = manager(ServiceConfig::default(), loader);

        let starter = lifecycle.clone();
        let start = tokio::spawn(async move { starter.start().await });

        let handle = lifecycle.get_handle().await.unwrap();
        assert!(handle.is_ready());
        start.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_policy_times_out_with_service_unavailable() {
        let mut config = ServiceConfig::default();
        config.readiness.timeout_secs = 0;
        let lifecycle = manager(config, SlowLoader::new(0, false));

        let err = lifecycle.get_handle().await.unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn fail_fast_policy_returns_not_ready() {
        let mut config = ServiceConfig::default();
        config.readiness.policy = ReadinessPolicy::FailFast;
        let lifecycle = manager(config, SlowLoader::new(0, false));

        let err = lifecycle.get_handle().await.unwrap_err();
        assert!(matches!(err, Error::NotReady(_)));
    }

    #[tokio::test]
    async fn lazy_mode_initializes_on_first_request() {
        let mut config = ServiceConfig::default();
        config.readiness.init_mode = InitMode::Lazy;
        let loader = SlowLoader::new(20, false);
        let lifecycle = manager(config, loader.clone());
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);

        let (a, b) = tokio::join!(lifecycle.get_handle(), lifecycle.get_handle());
        assert!(a.unwrap().is_ready());
        assert!(b.unwrap().is_ready());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remote_only_deployment_skips_load() {
        let mut config = ServiceConfig::default();
        config.model.source = ModelSource::None;
        config.backends[0].kind = crate::config::BackendKind::Remote;
        config.backends[0].base_url = Some("http://127.0.0.1:9".into());
        let loader = SlowLoader::new(0, false);
        let lifecycle = manager(config, loader.clone());

        let handle = lifecycle.start().await.unwrap();
        assert!(!handle.has_resident_model());
        assert!(handle.is_ready());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_memory_fraction_fails_initialization() {
        let mut config = ServiceConfig::default();
        config.device.memory_fraction = 1.5;
        let lifecycle = manager(config, SlowLoader::new(0, false));
        assert!(matches!(
            lifecycle.initialize().await,
            Err(Error::FatalInit(_))
        ));
        assert_eq!(lifecycle.state(), LifecycleState::Failed);
    }
}
