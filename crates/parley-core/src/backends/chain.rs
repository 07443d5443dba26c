//! Priority-ordered failover across backends.
//!
//! Each request walks the candidates in priority order, skipping
//! `Unavailable` ones and trying every other candidate at most once. A failed
//! attempt marks the candidate `Degraded`, but degraded candidates are still
//! tried on the next request. Only the health monitor (or an explicit
//! [`BackendFallbackChain::set_health`]) marks a candidate `Unavailable`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BackendError, Error, Result};
use crate::runtime::types::{ModelInput, RawOutput};
use crate::telemetry::AttemptRecord;

use super::{Backend, BackendDescriptor, Health, InvokeContext};

struct Candidate {
    backend: Arc<dyn Backend>,
    priority: u32,
}

/// Output of a successful chain invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Served {
    pub backend: String,
    pub output: RawOutput,
}

/// Every attempt made for one request, and how it ended.
#[derive(Debug)]
pub struct ChainOutcome {
    pub attempts: Vec<AttemptRecord>,
    pub result: Result<Served>,
}

pub struct BackendFallbackChain {
    candidates: Vec<Candidate>,
    health: Mutex<Vec<Health>>,
    attempt_timeout: Duration,
}

impl BackendFallbackChain {
    /// Build a chain; candidates are ordered by priority, ties keep
    /// insertion order.
    pub fn new(backends: Vec<(Arc<dyn Backend>, u32)>, attempt_timeout: Duration) -> Self {
        let mut candidates: Vec<Candidate> = backends
            .into_iter()
            .map(|(backend, priority)| Candidate { backend, priority })
            .collect();
        candidates.sort_by_key(|c| c.priority);
        let health = Mutex::new(vec![Health::Healthy; candidates.len()]);

        Self {
            candidates,
            health,
            attempt_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Try candidates in priority order until one succeeds.
    pub async fn invoke(&self, input: &ModelInput, ctx: &InvokeContext) -> ChainOutcome {
        let mut attempts = Vec::new();
        let mut last_error: Option<BackendError> = None;

        for (index, candidate) in self.candidates.iter().enumerate() {
            let id = candidate.backend.id();
            if self.health_of(index) == Health::Unavailable {
                debug!("Request {}: skipping unavailable backend {}", ctx.request_id, id);
                continue;
            }

            let attempt_ctx = ctx.for_attempt();
            let started = Instant::now();
            let result =
                match tokio::time::timeout(self.attempt_timeout, candidate.backend.invoke(input, &attempt_ctx))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        attempt_ctx.cancel.cancel();
                        Err(BackendError::timeout(format!(
                            "{} did not respond within {:.1}s",
                            id,
                            self.attempt_timeout.as_secs_f64()
                        )))
                    }
                };
            let duration = started.elapsed();
            let result = result.and_then(|output| {
                if output.fits(input.task()) {
                    Ok(output)
                } else {
                    Err(BackendError::remote(format!(
                        "{} returned {} output for a {} request",
                        id,
                        output.kind_name(),
                        input.task()
                    )))
                }
            });

            match result {
                Ok(output) => {
                    self.set_health_at(index, Health::Healthy);
                    attempts.push(AttemptRecord {
                        backend: id.to_string(),
                        duration,
                        error: None,
                    });
                    return ChainOutcome {
                        attempts,
                        result: Ok(Served {
                            backend: id.to_string(),
                            output,
                        }),
                    };
                }
                Err(err) => {
                    warn!(
                        "Request {}: backend {} failed after {:.3}s: {}",
                        ctx.request_id,
                        id,
                        duration.as_secs_f64(),
                        err
                    );
                    self.set_health_at(index, Health::Degraded);
                    attempts.push(AttemptRecord {
                        backend: id.to_string(),
                        duration,
                        error: Some(err.clone()),
                    });
                    last_error = Some(err);
                }
            }
        }

        let last = last_error.unwrap_or_else(|| BackendError::unavailable("no backend available"));
        ChainOutcome {
            result: Err(Error::AllBackendsFailed {
                attempts: attempts.len(),
                last,
            }),
            attempts,
        }
    }

    fn health_of(&self, index: usize) -> Health {
        self.health
            .lock()
            .ok()
            .and_then(|h| h.get(index).copied())
            .unwrap_or(Health::Unavailable)
    }

    fn set_health_at(&self, index: usize, health: Health) {
        if let Ok(mut all) = self.health.lock() {
            if let Some(slot) = all.get_mut(index) {
                if *slot != health {
                    debug!(
                        "Backend {} health {} -> {}",
                        self.candidates[index].backend.id(),
                        slot,
                        health
                    );
                }
                *slot = health;
            }
        }
    }

    /// Override a candidate's health. Returns false for unknown ids.
    pub fn set_health(&self, id: &str, health: Health) -> bool {
        match self.candidates.iter().position(|c| c.backend.id() == id) {
            Some(index) => {
                self.set_health_at(index, health);
                true
            }
            None => false,
        }
    }

    /// Descriptors in priority order.
    pub fn snapshot(&self) -> Vec<BackendDescriptor> {
        self.candidates
            .iter()
            .enumerate()
            .map(|(index, c)| BackendDescriptor {
                id: c.backend.id().to_string(),
                priority: c.priority,
                capabilities: c.backend.capabilities(),
                health: self.health_of(index),
            })
            .collect()
    }

    /// Probe every candidate once: a passing probe marks it healthy, a
    /// failing one unavailable.
    pub async fn probe_health(&self) -> Vec<BackendDescriptor> {
        for (index, candidate) in self.candidates.iter().enumerate() {
            match candidate.backend.health_check().await {
                Ok(()) => {
                    if self.health_of(index) == Health::Unavailable {
                        info!("Backend {} is reachable again", candidate.backend.id());
                    }
                    self.set_health_at(index, Health::Healthy);
                }
                Err(err) => {
                    warn!("Backend {} failed health check: {}", candidate.backend.id(), err);
                    self.set_health_at(index, Health::Unavailable);
                }
            }
        }
        self.snapshot()
    }

    /// Probe all candidates every `interval` in the background.
    pub fn spawn_health_monitor(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        info!(
            "Spawning backend health monitor every {:.1}s",
            interval.as_secs_f64()
        );

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tick.tick().await;
                self.probe_health().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, ModelSpec};
    use crate::error::BackendErrorKind;
    use crate::model::{DevicePlacement, MemoryBudget, ModelHandle, ModelId};
    use crate::params::TranslationParams;
    use crate::runtime::types::TranslationInput;
    use crate::task::TaskKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubBackend {
        id: String,
        fail_with: Option<BackendError>,
        delay: Duration,
        calls: AtomicUsize,
        healthy: AtomicBool,
    }

    impl StubBackend {
        fn ok(id: &str) -> Arc<Self> {
            Self::build(id, None, Duration::ZERO)
        }

        fn failing(id: &str, err: BackendError) -> Arc<Self> {
            Self::build(id, Some(err), Duration::ZERO)
        }

        fn build(id: &str, fail_with: Option<BackendError>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                fail_with,
                delay,
                calls: AtomicUsize::new(0),
                healthy: AtomicBool::new(true),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Backend for StubBackend {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Remote
        }

        async fn invoke(
            &self,
            _input: &ModelInput,
            _ctx: &InvokeContext,
        ) -> std::result::Result<RawOutput, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(RawOutput::Text(format!("from {}", self.id))),
            }
        }

        async fn health_check(&self) -> std::result::Result<(), BackendError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(BackendError::unavailable("probe failed"))
            }
        }
    }

    fn chain(backends: Vec<(Arc<StubBackend>, u32)>) -> BackendFallbackChain {
        BackendFallbackChain::new(
            backends
                .into_iter()
                .map(|(b, p)| (b as Arc<dyn Backend>, p))
                .collect(),
            Duration::from_millis(200),
        )
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

    fn ctx() -> InvokeContext {
        let handle = ModelHandle::new(
            ModelId::new(TaskKind::Translation, &ModelSpec::default()),
            DevicePlacement::cpu(),
            MemoryBudget::resolve(0.9, 0.95, None).unwrap(),
            None,
        );
        InvokeContext::new("req", Arc::new(handle))
    }

    fn health(chain: &BackendFallbackChain, id: &str) -> Health {
        chain
            .snapshot()
            .into_iter()
            .find(|d| d.id == id)
            .map(|d| d.health)
            .unwrap()
    }

    #[tokio::test]
    async fn falls_back_to_second_candidate() {
        let primary = StubBackend::failing("hosted", BackendError::remote("502 bad gateway"));
        let secondary = StubBackend::ok("local");
        let chain = chain(vec![(primary.clone(), 0), (secondary.clone(), 1)]);

        for _ in 0..3 {
            let outcome = chain.invoke(&input(), &ctx()).await;
            let served = outcome.result.unwrap();
            assert_eq!(served.backend, "local");
            assert_eq!(outcome.attempts.len(), 2);
            assert_eq!(outcome.attempts.iter().filter(|a| !a.succeeded()).count(), 1);
            assert!(outcome.attempts[1].succeeded());
        }

        // Degraded candidates are retried on every request.
        assert_eq!(primary.calls(), 3);
        assert_eq!(health(&chain, "hosted"), Health::Degraded);
        assert_eq!(health(&chain, "local"), Health::Healthy);
    }

    struct AudioBackend;

    #[async_trait]
    impl Backend for AudioBackend {
        fn id(&self) -> &str {
            "speech-only"
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Remote
        }

        async fn invoke(
            &self,
            _input: &ModelInput,
            _ctx: &InvokeContext,
        ) -> std::result::Result<RawOutput, BackendError> {
            Ok(RawOutput::Audio(crate::audio::AudioBuffer::new(vec![0.1; 16], 16000)))
        }
    }

    #[tokio::test]
    async fn wrong_output_kind_degrades_and_falls_back() {
        let fallback = StubBackend::ok("local");
        let chain = BackendFallbackChain::new(
            vec![
                (Arc::new(AudioBackend) as Arc<dyn Backend>, 0),
                (fallback.clone() as Arc<dyn Backend>, 1),
            ],
            Duration::from_millis(200),
        );

        let outcome = chain.invoke(&input(), &ctx()).await;
        assert_eq!(outcome.result.unwrap().backend, "local");
        let first = outcome.attempts[0].error.as_ref().unwrap();
        assert_eq!(first.kind, BackendErrorKind::Remote);
        assert!(first.message.contains("audio output"));
        assert_eq!(health(&chain, "speech-only"), Health::Degraded);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn all_failing_reports_last_cause() {
        let a = StubBackend::failing("a", BackendError::remote("first"));
        let b = StubBackend::failing("b", BackendError::device("out of memory"));
        let chain = chain(vec![(a.clone(), 0), (b.clone(), 1)]);

        let outcome = chain.invoke(&input(), &ctx()).await;
        assert_eq!(outcome.attempts.len(), 2);
        match outcome.result {
            Err(Error::AllBackendsFailed { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert_eq!(last, BackendError::device("out of memory"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn priority_decides_order_not_insertion() {
        let low = StubBackend::ok("low");
        let high = StubBackend::ok("high");
        let chain = chain(vec![(low.clone(), 5), (high.clone(), 1)]);

        let served = chain.invoke(&input(), &ctx()).await.result.unwrap();
        assert_eq!(served.backend, "high");
        assert_eq!(low.calls(), 0);
    }

    #[tokio::test]
    async fn slow_candidate_times_out_and_falls_back() {
        let slow = StubBackend::build("slow", None, Duration::from_secs(5));
        let fast = StubBackend::ok("fast");
        let chain = chain(vec![(slow, 0), (fast, 1)]);

        let outcome = chain.invoke(&input(), &ctx()).await;
        assert_eq!(outcome.result.unwrap().backend, "fast");
        let first = outcome.attempts[0].error.as_ref().unwrap();
        assert_eq!(first.kind, BackendErrorKind::Timeout);
    }

    #[tokio::test]
    async fn unavailable_candidates_are_skipped() {
        let a = StubBackend::ok("a");
        let b = StubBackend::ok("b");
        let chain = chain(vec![(a.clone(), 0), (b.clone(), 1)]);

        assert!(chain.set_health("a", Health::Unavailable));
        assert!(!chain.set_health("missing", Health::Unavailable));

        let outcome = chain.invoke(&input(), &ctx()).await;
        assert_eq!(outcome.result.unwrap().backend, "b");
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(a.calls(), 0);

        chain.set_health("b", Health::Unavailable);
        let outcome = chain.invoke(&input(), &ctx()).await;
        match outcome.result {
            Err(Error::AllBackendsFailed { attempts, last }) => {
                assert_eq!(attempts, 0);
                assert_eq!(last.kind, BackendErrorKind::Unavailable);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn probes_mark_unavailable_and_recover() {
        let a = StubBackend::ok("a");
        let chain = Arc::new(chain(vec![(a.clone(), 0)]));

        a.healthy.store(false, Ordering::SeqCst);
        let snapshot = chain.probe_health().await;
        assert_eq!(snapshot[0].health, Health::Unavailable);
        assert_eq!(snapshot[0].capabilities, vec!["remote".to_string()]);

        a.healthy.store(true, Ordering::SeqCst);
        let monitor = chain.clone().spawn_health_monitor(Duration::from_millis(10));
        for _ in 0..50 {
            if health(&chain, "a") == Health::Healthy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        monitor.abort();
        assert_eq!(health(&chain, "a"), Health::Healthy);
    }
}
