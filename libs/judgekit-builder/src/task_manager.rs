/// Timeout-Enforcing Task Manager
///
/// **Core Responsibility:**
/// Run independent units of work (one per test case) concurrently, each
/// under its own deadline, and return one result per unit in input order.
///
/// **Critical Properties:**
/// - Concurrency bounded by `max_concurrency`
/// - A unit's deadline starts when the unit starts, not when it is queued
///   or while it waits on its admission semaphore
/// - On expiry the unit's future is dropped; units that own processes kill
///   their process group on drop, so termination never relies on the unit
///   cooperating
/// - A timed-out unit never disturbs results already collected for others
/// - The total batch deadline is independent of per-unit deadlines
/// - Every slot is filled exactly once: late completions are ignored

use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Why a unit has no result of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The unit ran past its own deadline.
    Unit,
    /// The batch deadline expired first. `started` tells whether the unit
    /// had begun running.
    Batch { started: bool },
}

/// One unit of work with its deadline.
pub struct Unit<F> {
    pub deadline: Duration,
    pub work: F,
    /// Shared limit the unit must get a permit from before it starts.
    pub admission: Option<Arc<Semaphore>>,
}

impl<F> Unit<F> {
    pub fn new(deadline: Duration, work: F) -> Self {
        Self {
            deadline,
            work,
            admission: None,
        }
    }

    /// Hold a permit from `admission` for the whole run. Waiting for it
    /// does not count against the deadline.
    pub fn admitted_by(mut self, admission: Arc<Semaphore>) -> Self {
        self.admission = Some(admission);
        self
    }
}

enum UnitOutcome<T> {
    Done(T),
    TimedOut,
    Panicked(String),
}

#[derive(Debug, Clone)]
pub struct TaskManager {
    max_concurrency: usize,
    total_timeout: Option<Duration>,
}

impl TaskManager {
    pub fn new(max_concurrency: usize, total_timeout: Option<Duration>) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            total_timeout,
        }
    }

    /// Run all `units`, returning their results in input order.
    ///
    /// ## Arguments
    /// * `on_timeout` - builds the result for a unit that ran out of time
    /// * `on_panic` - builds the result for a unit whose work panicked
    pub async fn run<T, F, OnTimeout, OnPanic>(
        &self,
        units: Vec<Unit<F>>,
        on_timeout: OnTimeout,
        on_panic: OnPanic,
    ) -> Vec<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
        OnTimeout: Fn(usize, TimeoutKind) -> T,
        OnPanic: Fn(usize, String) -> T,
    {
        let total = units.len();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let started: Arc<Vec<AtomicBool>> =
            Arc::new((0..total).map(|_| AtomicBool::new(false)).collect());
        let mut slots: Vec<Option<T>> = (0..total).map(|_| None).collect();
        let mut set = JoinSet::new();

        for (index, unit) in units.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let started = Arc::clone(&started);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let _admitted = match unit.admission {
                    Some(admission) => admission.acquire_owned().await.ok(),
                    None => None,
                };
                started[index].store(true, Ordering::SeqCst);
                let work = AssertUnwindSafe(unit.work).catch_unwind();
                let outcome = match tokio::time::timeout(unit.deadline, work).await {
                    Ok(Ok(value)) => UnitOutcome::Done(value),
                    Ok(Err(panic)) => UnitOutcome::Panicked(panic_message(panic.as_ref())),
                    Err(_) => UnitOutcome::TimedOut,
                };
                (index, outcome)
            });
        }

        let batch_deadline = self.total_timeout.map(|timeout| Instant::now() + timeout);
        let mut batch_expired = false;

        loop {
            let joined = match batch_deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, set.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        batch_expired = true;
                        break;
                    }
                },
                None => set.join_next().await,
            };
            let Some(joined) = joined else { break };

            match joined {
                Ok((index, outcome)) => {
                    if slots[index].is_some() {
                        continue;
                    }
                    slots[index] = Some(match outcome {
                        UnitOutcome::Done(value) => value,
                        UnitOutcome::TimedOut => {
                            debug!(unit = index, "unit deadline expired");
                            on_timeout(index, TimeoutKind::Unit)
                        }
                        UnitOutcome::Panicked(message) => {
                            warn!(unit = index, panic = %message, "unit panicked");
                            on_panic(index, message)
                        }
                    });
                }
                Err(e) => warn!(error = %e, "unit task did not complete"),
            }
        }

        if batch_expired {
            warn!(
                pending = set.len(),
                "batch deadline expired, aborting remaining units"
            );
            set.abort_all();
            // Wait for the aborted futures to be dropped so their processes are gone.
            while set.join_next().await.is_some() {}
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    let started = started[index].load(Ordering::SeqCst);
                    on_timeout(index, TimeoutKind::Batch { started })
                })
            })
            .collect()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unit panicked".to_string()
    }
}
