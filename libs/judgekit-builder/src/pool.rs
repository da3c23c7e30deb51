/// Submission Pool - Bounded Queue and Worker Tasks
///
/// **Core Responsibility:**
/// Accept submissions, test a fixed number of them at a time and publish
/// every verdict on the result channel, correlated by submission id.
///
/// **Critical Properties:**
/// - The queue is bounded: `submit` waits for room, `try_submit` refuses
/// - A panic while judging one submission becomes an `INTERNAL_ERROR`
///   verdict for that submission; the worker keeps running
/// - Every accepted submission produces exactly one result, including
///   those still queued or running when shutdown cancels them

use crate::metrics::{HealthSnapshot, PoolMetrics};
use crate::tester::Judge;
use async_trait::async_trait;
use futures_util::future::join_all;
use judgekit_common::config::BuilderConfig;
use judgekit_common::types::{CompletedSubmission, SubmissionId, SubmissionRequest, SubmissionResult};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

pub const CANCELLED_MESSAGE: &str = "submission cancelled by shutdown";
pub const PANIC_MESSAGE: &str = "submission processing panicked";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("the pool is shutting down")]
    ShuttingDown,

    #[error("the submission queue is full")]
    QueueFull,
}

/// Whatever turns a request into a verdict.
#[async_trait]
pub trait JudgeSubmission: Send + Sync {
    async fn judge(&self, request: &SubmissionRequest) -> SubmissionResult;
}

#[async_trait]
impl JudgeSubmission for Judge {
    async fn judge(&self, request: &SubmissionRequest) -> SubmissionResult {
        Judge::judge(self, request).await
    }
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<SubmissionRequest>>>;

pub struct SubmissionPool {
    sender: Mutex<Option<mpsc::Sender<SubmissionRequest>>>,
    receiver: SharedReceiver,
    results: mpsc::UnboundedSender<CompletedSubmission>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: watch::Sender<bool>,
    metrics: Arc<PoolMetrics>,
}

impl SubmissionPool {
    /// Spawn `config.pool_size` workers. Must be called inside a runtime.
    pub fn start(
        judge: Arc<dyn JudgeSubmission>,
        config: &BuilderConfig,
        metrics: Arc<PoolMetrics>,
    ) -> (Self, mpsc::UnboundedReceiver<CompletedSubmission>) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let (results, results_rx) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = watch::channel(false);
        let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let workers = (0..config.pool_size.max(1))
            .map(|index| {
                tokio::spawn(worker(
                    index,
                    Arc::clone(&receiver),
                    Arc::clone(&judge),
                    results.clone(),
                    Arc::clone(&metrics),
                    cancel_rx.clone(),
                ))
            })
            .collect();

        info!(
            workers = config.pool_size.max(1),
            queue_capacity = config.queue_capacity.max(1),
            "submission pool started"
        );

        let pool = Self {
            sender: Mutex::new(Some(sender)),
            receiver,
            results,
            workers: Mutex::new(workers),
            cancel,
            metrics,
        };
        (pool, results_rx)
    }

    fn sender(&self) -> Result<mpsc::Sender<SubmissionRequest>, PoolError> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PoolError::ShuttingDown)
    }

    /// Queue a submission, waiting while the queue is full. Dropping the
    /// returned future before it resolves leaves nothing queued.
    pub async fn submit(&self, request: SubmissionRequest) -> Result<SubmissionId, PoolError> {
        let sender = self.sender()?;
        let permit = sender.reserve().await.map_err(|_| PoolError::ShuttingDown)?;
        let id = request.id;
        self.metrics.queued();
        permit.send(request);
        Ok(id)
    }

    /// Queue a submission or fail immediately if there is no room.
    pub fn try_submit(&self, request: SubmissionRequest) -> Result<SubmissionId, PoolError> {
        let sender = self.sender()?;
        let permit = sender.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => PoolError::QueueFull,
            mpsc::error::TrySendError::Closed(()) => PoolError::ShuttingDown,
        })?;
        let id = request.id;
        self.metrics.queued();
        permit.send(request);
        Ok(id)
    }

    pub fn health(&self) -> HealthSnapshot {
        self.metrics.snapshot()
    }

    /// Stop accepting work, give in-flight and queued submissions `grace`
    /// to finish, then cancel the rest. Cancelled submissions still get an
    /// `INTERNAL_ERROR` result.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        info!("submission pool shutting down");

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let mut joined = Box::pin(join_all(workers));
        if tokio::time::timeout(grace, joined.as_mut()).await.is_err() {
            warn!("grace period expired, cancelling remaining submissions");
            let _ = self.cancel.send(true);
            joined.await;
        }

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        while let Some(request) = receiver.recv().await {
            self.metrics.dequeued();
            let result = SubmissionResult::internal_error(&request.test_cases, CANCELLED_MESSAGE);
            self.metrics.record(&result);
            publish(&self.results, request.id, result);
        }
        info!("submission pool stopped");
    }
}

fn publish(results: &mpsc::UnboundedSender<CompletedSubmission>, id: SubmissionId, result: SubmissionResult) {
    if results.send(CompletedSubmission { id, result }).is_err() {
        warn!(submission_id = %id, "result receiver dropped, discarding result");
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn worker(
    index: usize,
    receiver: SharedReceiver,
    judge: Arc<dyn JudgeSubmission>,
    results: mpsc::UnboundedSender<CompletedSubmission>,
    metrics: Arc<PoolMetrics>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => None,
                request = receiver.recv() => request,
            }
        };
        let Some(request) = next else { break };

        metrics.dequeued();
        metrics.started();
        let id = request.id;
        let test_cases = request.test_cases.clone();

        let judge = Arc::clone(&judge);
        let mut task = tokio::spawn(async move { judge.judge(&request).await });

        let result = tokio::select! {
            biased;
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(worker = index, submission_id = %id, error = %e, "judging task failed");
                    SubmissionResult::internal_error(&test_cases, PANIC_MESSAGE)
                }
            },
            _ = cancelled(&mut cancel) => {
                task.abort();
                let _ = task.await;
                warn!(worker = index, submission_id = %id, "submission cancelled");
                SubmissionResult::internal_error(&test_cases, CANCELLED_MESSAGE)
            }
        };

        metrics.finished(&result);
        publish(&results, id, result);
    }
    info!(worker = index, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use judgekit_common::types::{
        CompilationResult, Problem, ProblemType, TestCase, TestOutcome, TestResult,
    };
    use prometheus::Registry;
    use std::collections::HashSet;

    /// Program text drives the stub: `sleep:<ms>`, `panic` or `hang`.
    struct Scripted;

    #[async_trait]
    impl JudgeSubmission for Scripted {
        async fn judge(&self, request: &SubmissionRequest) -> SubmissionResult {
            match request.program_text.as_str() {
                "panic" => panic!("judge blew up"),
                "hang" => tokio::time::sleep(Duration::from_secs(3600)).await,
                text => {
                    let ms = text.strip_prefix("sleep:").and_then(|ms| ms.parse().ok()).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
            }
            let results = request
                .test_cases
                .iter()
                .map(|_| TestResult::new(TestOutcome::Passed, "Passed"))
                .collect();
            SubmissionResult::new(CompilationResult::success(), results)
        }
    }

    fn request(program: &str) -> SubmissionRequest {
        SubmissionRequest::new(
            Problem::new(ProblemType::CProgram, ""),
            vec![TestCase::new("a", "", ""), TestCase::new("b", "", "")],
            program,
        )
    }

    fn pool(pool_size: usize, queue_capacity: usize) -> (SubmissionPool, mpsc::UnboundedReceiver<CompletedSubmission>) {
        let config = BuilderConfig {
            pool_size,
            queue_capacity,
            ..BuilderConfig::default()
        };
        let metrics = Arc::new(PoolMetrics::new(&Registry::new()).unwrap());
        SubmissionPool::start(Arc::new(Scripted), &config, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_are_correlated_by_id() {
        let (pool, mut results) = pool(3, 8);
        let mut ids = HashSet::new();
        for program in ["sleep:300", "sleep:100", "sleep:200"] {
            ids.insert(pool.submit(request(program)).await.unwrap());
        }

        let mut seen = HashSet::new();
        for _ in 0..3 {
            let completed = results.recv().await.unwrap();
            assert!(completed.result.all_passed());
            seen.insert(completed.id);
        }

        assert_eq!(seen, ids);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_isolated_to_its_submission() {
        let (pool, mut results) = pool(1, 4);
        let bad = pool.submit(request("panic")).await.unwrap();
        let good = pool.submit(request("sleep:10")).await.unwrap();

        let first = results.recv().await.unwrap();
        assert_eq!(first.id, bad);
        assert_eq!(first.result.test_results.len(), 2);
        assert!(first
            .result
            .test_results
            .iter()
            .all(|r| r.outcome == TestOutcome::InternalError));

        let second = results.recv().await.unwrap();
        assert_eq!(second.id, good);
        assert!(second.result.all_passed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_submit_reports_full_queue() {
        let (pool, _results) = pool(1, 1);
        pool.try_submit(request("hang")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.try_submit(request("hang")).unwrap();
        assert_eq!(pool.try_submit(request("hang")), Err(PoolError::QueueFull));
        assert_eq!(pool.health().queue_depth, 1);
        assert_eq!(pool.health().in_flight, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_shutdown_finishes_queued_work() {
        let (pool, mut results) = pool(1, 4);
        pool.submit(request("sleep:50")).await.unwrap();
        pool.submit(request("sleep:50")).await.unwrap();

        pool.shutdown(Duration::from_secs(10)).await;

        for _ in 0..2 {
            assert!(results.recv().await.unwrap().result.all_passed());
        }
        assert_eq!(pool.submit(request("sleep:1")).await, Err(PoolError::ShuttingDown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_shutdown_cancels_everything() {
        let (pool, mut results) = pool(1, 4);
        let running = pool.submit(request("hang")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let queued = pool.submit(request("hang")).await.unwrap();

        pool.shutdown(Duration::from_millis(100)).await;

        let mut cancelled = HashSet::new();
        for _ in 0..2 {
            let completed = results.recv().await.unwrap();
            assert_eq!(completed.result.test_results[0].outcome, TestOutcome::InternalError);
            assert_eq!(completed.result.test_results[0].message, CANCELLED_MESSAGE);
            cancelled.insert(completed.id);
        }
        assert_eq!(cancelled, HashSet::from([running, queued]));

        let health = pool.health();
        assert_eq!(health.queue_depth, 0);
        assert_eq!(health.in_flight, 0);
        assert_eq!(health.completed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_submit_is_not_counted() {
        let (pool, _results) = pool(1, 1);
        pool.submit(request("hang")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.submit(request("hang")).await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.submit(request("hang"))).await;
        assert!(waiting.is_err());

        let health = pool.health();
        assert_eq!(health.queue_depth, 1);
        assert_eq!(health.in_flight, 1);
    }
}
