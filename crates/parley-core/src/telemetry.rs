//! Latency traces and the telemetry recorder.
//!
//! Every request, successful or not, produces a [`LatencyTrace`]. The
//! [`TelemetryRecorder`] folds traces into rolling windows and emits one
//! structured event per request on the `parley::telemetry` target.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::BackendError;
use crate::task::TaskKind;

const MAX_SAMPLES: usize = 1000;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Transform,
    Invoke,
    PostProcess,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Validate,
        Stage::Transform,
        Stage::Invoke,
        Stage::PostProcess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Transform => "transform",
            Stage::Invoke => "invoke",
            Stage::PostProcess => "post_process",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTiming {
    pub stage: Stage,
    pub duration: Duration,
}

/// One backend attempt made by the fallback chain.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub backend: String,
    pub duration: Duration,
    /// `None` when the attempt succeeded
    pub error: Option<BackendError>,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-stage timing breakdown of one request. Immutable once finished.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyTrace {
    stages: Vec<StageTiming>,
    total: Duration,
    attempts: Vec<AttemptRecord>,
}

impl LatencyTrace {
    pub fn stages(&self) -> &[StageTiming] {
        &self.stages
    }

    pub fn stage(&self, stage: Stage) -> Option<Duration> {
        self.stages
            .iter()
            .find(|t| t.stage == stage)
            .map(|t| t.duration)
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn stage_sum(&self) -> Duration {
        self.stages.iter().map(|t| t.duration).sum()
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn failed_attempts(&self) -> usize {
        self.attempts.iter().filter(|a| !a.succeeded()).count()
    }

    fn stage_ms(&self, stage: Stage) -> Option<f64> {
        self.stage(stage).map(|d| d.as_secs_f64() * 1000.0)
    }
}

/// Stopwatch that builds a [`LatencyTrace`].
///
/// Each `mark` closes the current stage at the same instant the next one
/// opens, so the stage durations add up to the total.
#[derive(Debug)]
pub struct StageClock {
    started: Instant,
    last_mark: Instant,
    stages: Vec<StageTiming>,
    attempts: Vec<AttemptRecord>,
}

impl StageClock {
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_mark: now,
            stages: Vec::with_capacity(Stage::ALL.len()),
            attempts: Vec::new(),
        }
    }

    /// Close `stage` at the current instant.
    pub fn mark(&mut self, stage: Stage) {
        let now = Instant::now();
        self.stages.push(StageTiming {
            stage,
            duration: now.duration_since(self.last_mark),
        });
        self.last_mark = now;
    }

    /// Close whichever stage was running when the request was abandoned.
    pub fn mark_interrupted(&mut self) {
        if let Some(stage) = Stage::ALL.get(self.stages.len()).copied() {
            self.mark(stage);
        }
    }

    pub fn record_attempts(&mut self, attempts: Vec<AttemptRecord>) {
        self.attempts.extend(attempts);
    }

    pub fn finish(self) -> LatencyTrace {
        LatencyTrace {
            total: self.last_mark.duration_since(self.started),
            stages: self.stages,
            attempts: self.attempts,
        }
    }
}

/// Amount of work a request represented, for throughput.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PayloadUnits {
    pub amount: f64,
    pub unit: &'static str,
    /// Seconds of generated audio, used for the real-time factor
    pub generated_audio_secs: Option<f64>,
}

impl PayloadUnits {
    pub fn chars(count: usize) -> Self {
        Self {
            amount: count as f64,
            unit: "chars",
            generated_audio_secs: None,
        }
    }

    pub fn audio_input(secs: f64) -> Self {
        Self {
            amount: secs,
            unit: "audio_secs",
            generated_audio_secs: None,
        }
    }

    pub fn audio_output(secs: f64) -> Self {
        Self {
            amount: secs,
            unit: "audio_secs",
            generated_audio_secs: Some(secs),
        }
    }
}

/// Rolling request telemetry for one deployment.
#[derive(Debug)]
pub struct TelemetryRecorder {
    task: TaskKind,
    latency_samples: RwLock<VecDeque<f64>>,
    stage_samples: RwLock<HashMap<Stage, VecDeque<f64>>>,
    throughput_samples: RwLock<VecDeque<f64>>,
    rtf_samples: RwLock<VecDeque<f64>>,
    total_requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    fallback_activations: AtomicU64,
    /// Payload units, stored in thousandths
    payload_units_milli: AtomicU64,
    failures_by_kind: Mutex<BTreeMap<&'static str, u64>>,
    start_time: Instant,
    max_samples: usize,
}

impl TelemetryRecorder {
    pub fn new(task: TaskKind) -> Self {
        Self {
            task,
            latency_samples: RwLock::new(VecDeque::with_capacity(MAX_SAMPLES)),
            stage_samples: RwLock::new(HashMap::new()),
            throughput_samples: RwLock::new(VecDeque::with_capacity(MAX_SAMPLES)),
            rtf_samples: RwLock::new(VecDeque::new()),
            total_requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            fallback_activations: AtomicU64::new(0),
            payload_units_milli: AtomicU64::new(0),
            failures_by_kind: Mutex::new(BTreeMap::new()),
            start_time: Instant::now(),
            max_samples: MAX_SAMPLES,
        }
    }

    pub fn task(&self) -> TaskKind {
        self.task
    }

    /// Record a request that produced a result.
    pub async fn record_success(
        &self,
        request_id: &str,
        trace: &LatencyTrace,
        backend: &str,
        units: PayloadUnits,
    ) {
        let total_secs = trace.total().as_secs_f64();
        let throughput = if total_secs > 0.0 {
            units.amount / total_secs
        } else {
            0.0
        };
        let rtf = units
            .generated_audio_secs
            .filter(|secs| *secs > 0.0)
            .map(|secs| total_secs / secs);

        self.successes.fetch_add(1, Ordering::Relaxed);
        self.payload_units_milli
            .fetch_add((units.amount.max(0.0) * 1000.0) as u64, Ordering::Relaxed);
        self.record_common(trace).await;
        push_sample(&self.throughput_samples, throughput, self.max_samples).await;
        if let Some(rtf) = rtf {
            push_sample(&self.rtf_samples, rtf, self.max_samples).await;
        }

        info!(
            target: "parley::telemetry",
            request_id,
            task = %self.task,
            outcome = "success",
            backend,
            total_ms = total_secs * 1000.0,
            validate_ms = trace.stage_ms(Stage::Validate),
            transform_ms = trace.stage_ms(Stage::Transform),
            invoke_ms = trace.stage_ms(Stage::Invoke),
            post_process_ms = trace.stage_ms(Stage::PostProcess),
            attempts = trace.attempts().len(),
            failed_attempts = trace.failed_attempts(),
            payload_units = units.amount,
            unit = units.unit,
            throughput,
            rtf,
            "request completed"
        );
    }

    /// Record a request that failed at some stage. The trace covers the
    /// stages that ran.
    pub async fn record_failure(&self, request_id: &str, trace: &LatencyTrace, kind: &'static str) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut by_kind) = self.failures_by_kind.lock() {
            *by_kind.entry(kind).or_insert(0) += 1;
        }
        self.record_common(trace).await;

        info!(
            target: "parley::telemetry",
            request_id,
            task = %self.task,
            outcome = "failure",
            error_kind = kind,
            total_ms = trace.total().as_secs_f64() * 1000.0,
            validate_ms = trace.stage_ms(Stage::Validate),
            transform_ms = trace.stage_ms(Stage::Transform),
            invoke_ms = trace.stage_ms(Stage::Invoke),
            post_process_ms = trace.stage_ms(Stage::PostProcess),
            attempts = trace.attempts().len(),
            failed_attempts = trace.failed_attempts(),
            "request failed"
        );
    }

    async fn record_common(&self, trace: &LatencyTrace) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if trace.failed_attempts() > 0 {
            self.fallback_activations.fetch_add(1, Ordering::Relaxed);
        }

        push_sample(
            &self.latency_samples,
            trace.total().as_secs_f64() * 1000.0,
            self.max_samples,
        )
        .await;

        let mut stages = self.stage_samples.write().await;
        for timing in trace.stages() {
            let samples = stages
                .entry(timing.stage)
                .or_insert_with(|| VecDeque::with_capacity(self.max_samples));
            if samples.len() >= self.max_samples {
                samples.pop_front();
            }
            samples.push_back(timing.duration.as_secs_f64() * 1000.0);
        }
    }

    pub async fn snapshot(&self) -> TelemetrySnapshot {
        let latency = self.latency_samples.read().await;
        let stages = self.stage_samples.read().await;
        let throughput = self.throughput_samples.read().await;
        let rtf = self.rtf_samples.read().await;

        let uptime_secs = self.start_time.elapsed().as_secs_f64();
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let failures_by_kind = self
            .failures_by_kind
            .lock()
            .map(|m| m.iter().map(|(k, v)| (k.to_string(), *v)).collect())
            .unwrap_or_default();

        let stage_stats = Stage::ALL
            .iter()
            .filter_map(|stage| {
                stages.get(stage).map(|samples| {
                    (
                        stage.as_str().to_string(),
                        StageStats {
                            avg_ms: compute_mean(samples),
                            p50_ms: compute_percentile(samples, 0.50),
                            p99_ms: compute_percentile(samples, 0.99),
                        },
                    )
                })
            })
            .collect();

        TelemetrySnapshot {
            task: self.task,
            uptime_secs,
            total_requests,
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            failures_by_kind,
            fallback_activations: self.fallback_activations.load(Ordering::Relaxed),
            total_payload_units: self.payload_units_milli.load(Ordering::Relaxed) as f64 / 1000.0,
            payload_unit: payload_unit(self.task),
            avg_latency_ms: compute_mean(&latency),
            p50_latency_ms: compute_percentile(&latency, 0.50),
            p90_latency_ms: compute_percentile(&latency, 0.90),
            p99_latency_ms: compute_percentile(&latency, 0.99),
            stages: stage_stats,
            avg_throughput: compute_mean(&throughput),
            avg_rtf: if rtf.is_empty() {
                None
            } else {
                Some(compute_mean(&rtf))
            },
            requests_per_sec: if uptime_secs > 0.0 {
                total_requests as f64 / uptime_secs
            } else {
                0.0
            },
        }
    }
}

fn payload_unit(task: TaskKind) -> &'static str {
    match task {
        TaskKind::Translation => "chars",
        TaskKind::Synthesis | TaskKind::Transcription => "audio_secs",
    }
}

async fn push_sample(window: &RwLock<VecDeque<f64>>, value: f64, max: usize) {
    let mut samples = window.write().await;
    if samples.len() >= max {
        samples.pop_front();
    }
    samples.push_back(value);
}

#[derive(Debug, Clone, Serialize)]
pub struct StageStats {
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p99_ms: f64,
}

/// Point-in-time view of the recorder, served at `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub task: TaskKind,
    pub uptime_secs: f64,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub failures_by_kind: BTreeMap<String, u64>,
    /// Requests where at least one backend attempt failed
    pub fallback_activations: u64,
    pub total_payload_units: f64,
    pub payload_unit: &'static str,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p90_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub stages: BTreeMap<String, StageStats>,
    /// Payload units per second
    pub avg_throughput: f64,
    /// Real-time factor of generated audio (< 1.0 = faster than real time)
    pub avg_rtf: Option<f64>,
    pub requests_per_sec: f64,
}

fn compute_mean(samples: &VecDeque<f64>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

fn compute_percentile(samples: &VecDeque<f64>, percentile: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let index = ((percentile * sorted.len() as f64) as usize).min(sorted.len() - 1);
    sorted[index]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace_with_attempts(attempts: Vec<AttemptRecord>) -> LatencyTrace {
        let mut clock = StageClock::start();
        for stage in Stage::ALL {
            std::thread::sleep(Duration::from_millis(1));
            clock.mark(stage);
        }
        clock.record_attempts(attempts);
        clock.finish()
    }

    #[test]
    fn stage_durations_sum_to_total() {
        let trace = trace_with_attempts(Vec::new());
        assert_eq!(trace.stages().len(), 4);
        assert_eq!(trace.stage_sum(), trace.total());
        let order: Vec<Stage> = trace.stages().iter().map(|t| t.stage).collect();
        assert_eq!(order, Stage::ALL.to_vec());
    }

    #[tokio::test]
    async fn records_success_and_failure() {
        let recorder = TelemetryRecorder::new(TaskKind::Translation);
        let trace = trace_with_attempts(vec![
            AttemptRecord {
                backend: "hosted".into(),
                duration: Duration::from_millis(1),
                error: Some(BackendError::remote("502")),
            },
            AttemptRecord {
                backend: "local".into(),
                duration: Duration::from_millis(1),
                error: None,
            },
        ]);

        recorder
            .record_success("req-1", &trace, "local", PayloadUnits::chars(4))
            .await;
        recorder
            .record_failure("req-2", &LatencyTrace::default(), "validation")
            .await;

        let snapshot = recorder.snapshot().await;
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.successes, 1);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.fallback_activations, 1);
        assert_eq!(snapshot.failures_by_kind.get("validation"), Some(&1));
        assert_eq!(snapshot.total_payload_units, 4.0);
        assert_eq!(snapshot.payload_unit, "chars");
        assert!(snapshot.stages.contains_key("invoke"));
        assert!(snapshot.avg_rtf.is_none());
    }

    #[tokio::test]
    async fn synthesis_records_real_time_factor() {
        let recorder = TelemetryRecorder::new(TaskKind::Synthesis);
        let trace = trace_with_attempts(Vec::new());
        recorder
            .record_success("req", &trace, "local", PayloadUnits::audio_output(2.0))
            .await;
        let snapshot = recorder.snapshot().await;
        assert!(snapshot.avg_rtf.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn sample_window_is_bounded() {
        let recorder = TelemetryRecorder::new(TaskKind::Translation);
        let trace = LatencyTrace::default();
        for _ in 0..(MAX_SAMPLES + 10) {
            recorder.record_failure("req", &trace, "backend").await;
        }
        assert_eq!(recorder.latency_samples.read().await.len(), MAX_SAMPLES);
        assert_eq!(
            recorder.snapshot().await.total_requests,
            (MAX_SAMPLES + 10) as u64
        );
    }

    #[test]
    fn percentile() {
        let samples: VecDeque<f64> = (1..=100).map(|i| i as f64).collect();
        assert!((compute_percentile(&samples, 0.50) - 50.0).abs() < 2.0);
        assert!((compute_percentile(&samples, 0.90) - 90.0).abs() < 2.0);
    }
}
