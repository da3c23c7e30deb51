/// Pool Metrics - Queue and Throughput Gauges
///
/// Registered on a caller-supplied prometheus [`Registry`]; there is no
/// global metrics state. Besides the live gauges, the pool keeps a short
/// history of queue depths to report the largest backlog over the last
/// five minutes.

use judgekit_common::types::{CompilationOutcome, SubmissionResult};
use prometheus::core::Collector;
use prometheus::{IntCounterVec, IntGauge, Opts, Registry};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const QUEUE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Point-in-time view of the pool, for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub queue_depth: i64,
    pub in_flight: i64,
    pub max_queue_depth_5m: i64,
    pub completed: u64,
}

pub struct PoolMetrics {
    queue_depth: IntGauge,
    in_flight: IntGauge,
    max_queue_depth_5m: IntGauge,
    completed: IntCounterVec,
    samples: Mutex<VecDeque<(Instant, i64)>>,
}

/// Label for a finished submission.
pub fn verdict_label(result: &SubmissionResult) -> &'static str {
    match result.compilation.outcome {
        CompilationOutcome::Success if result.all_passed() => "passed",
        CompilationOutcome::Success => "failed",
        CompilationOutcome::Failure => "compile_failure",
        CompilationOutcome::BuilderError => "builder_error",
        CompilationOutcome::UnexpectedCompilerError => "unexpected_compiler_error",
    }
}

impl PoolMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let queue_depth = IntGauge::new("judgekit_queue_depth", "Submissions waiting for a worker")?;
        let in_flight = IntGauge::new("judgekit_in_flight", "Submissions being tested")?;
        let max_queue_depth_5m = IntGauge::new(
            "judgekit_queue_depth_max_5m",
            "Largest queue depth seen in the last five minutes",
        )?;
        let completed = IntCounterVec::new(
            Opts::new("judgekit_submissions_total", "Finished submissions by verdict"),
            &["verdict"],
        )?;

        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(max_queue_depth_5m.clone()))?;
        registry.register(Box::new(completed.clone()))?;

        Ok(Self {
            queue_depth,
            in_flight,
            max_queue_depth_5m,
            completed,
            samples: Mutex::new(VecDeque::new()),
        })
    }

    pub fn queued(&self) {
        self.queue_depth.inc();
        self.sample(Instant::now(), self.queue_depth.get());
    }

    pub fn dequeued(&self) {
        self.queue_depth.dec();
        self.sample(Instant::now(), self.queue_depth.get());
    }

    pub fn started(&self) {
        self.in_flight.inc();
    }

    pub fn finished(&self, result: &SubmissionResult) {
        self.in_flight.dec();
        self.record(result);
    }

    /// Count a result that was produced without the submission running.
    pub fn record(&self, result: &SubmissionResult) {
        self.completed.with_label_values(&[verdict_label(result)]).inc();
    }

    fn sample(&self, now: Instant, depth: i64) {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back((now, depth));
        self.refresh_window(now);
    }

    /// Drop samples older than the window and republish the largest depth
    /// still inside it. The current depth always counts.
    fn refresh_window(&self, now: Instant) -> i64 {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(&(at, _)) = samples.front() {
            if now.saturating_duration_since(at) <= QUEUE_WINDOW {
                break;
            }
            samples.pop_front();
        }
        let current = self.queue_depth.get();
        let max = samples.iter().map(|&(_, d)| d).fold(current, i64::max);
        self.max_queue_depth_5m.set(max);
        max
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot_at(Instant::now())
    }

    fn snapshot_at(&self, now: Instant) -> HealthSnapshot {
        let max_queue_depth_5m = self.refresh_window(now);
        let completed = self
            .completed
            .collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .map(|metric| metric.get_counter().get_value() as u64)
            .sum();
        HealthSnapshot {
            queue_depth: self.queue_depth.get(),
            in_flight: self.in_flight.get(),
            max_queue_depth_5m,
            completed,
        }
    }
}
