//! Bounded worker pool for solver calls.
//!
//! Solver calls are CPU-bound and may block for minutes, so each work item
//! runs on tokio's blocking thread pool. A semaphore sized to the worker count
//! bounds how many run at once; the permit travels into the blocking closure
//! and is released only when the solver actually returns.
//!
//! # Timeouts
//!
//! A blocking call cannot be cancelled from the outside, so the item timeout
//! is handed to the solver as a deadline on its [`SolveRequest`]. The pool
//! always waits for the call to return and then classifies it: a
//! [`SolverError::TimedOut`] or a call that overran its deadline becomes an
//! [`ItemStatus::Timeout`] failure and its samples are dropped. The external
//! command solver kills its child at the deadline, which frees the worker.
//! An in-process solver that never looks at the deadline keeps its worker
//! busy until it returns.
//!
//! # Features
//!
//! - Worker count defaults to `max(1, available_parallelism - 2)`
//! - Per-item failures (errors, panics, timeouts) never poison a batch
//! - Batch-level faults surface as [`PoolError`]
//! - Solve counts, sample yield and solver time per pool

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::solver::{check_samples, EquilibriumSolver, SolveRequest, SolverContext, SolverError};
use crate::space::Combination;

use super::work_item::{
    BatchOutcome, ItemFailure, ItemOutcome, ItemStatus, ItemSuccess, WorkItem,
};

/// Batch-level errors. Per-item problems are reported as [`ItemFailure`].
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool was configured without workers.
    #[error("Worker pool needs at least one worker")]
    NoWorkers,

    /// The pool has been closed.
    #[error("Worker pool is closed")]
    Closed,

    /// A batch contained items from another combination.
    #[error("Batch for {expected} contains an item for {found}")]
    MixedBatch { expected: String, found: String },

    /// A dispatch task died outside the solver call.
    #[error("Dispatch task failed: {0}")]
    Join(String),
}

/// Returns `max(1, available_parallelism - 2)`.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(2)
        .max(1)
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of solver calls allowed to run at once.
    pub num_workers: usize,
    /// Maximum time to wait for a single solver call.
    pub item_timeout: Option<Duration>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: default_worker_count(),
            item_timeout: None,
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the per-item timeout.
    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = Some(timeout);
        self
    }
}

/// What the pool has solved so far.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub num_workers: usize,
    /// Solver calls running right now.
    pub busy_workers: usize,
    /// Items that returned valid samples.
    pub items_solved: u64,
    /// Items that errored or panicked.
    pub items_failed: u64,
    /// Items that ran past the item timeout.
    pub items_timed_out: u64,
    /// Equilibrium samples returned by solved items.
    pub samples_returned: u64,
    /// Wall time spent inside solver calls, summed over workers.
    pub solver_time: Duration,
}

impl PoolStats {
    pub fn items_attempted(&self) -> u64 {
        self.items_solved + self.items_failed + self.items_timed_out
    }

    /// Percentage of attempted items that were solved.
    pub fn success_rate(&self) -> f64 {
        let attempted = self.items_attempted();
        if attempted == 0 {
            return 0.0;
        }
        (self.items_solved as f64 / attempted as f64) * 100.0
    }

    /// Mean number of temperature samples per solved item.
    pub fn samples_per_item(&self) -> f64 {
        if self.items_solved == 0 {
            return 0.0;
        }
        self.samples_returned as f64 / self.items_solved as f64
    }

    pub fn mean_solve_time(&self) -> Duration {
        match self.items_attempted() {
            0 => Duration::ZERO,
            n => self.solver_time.div_f64(n as f64),
        }
    }
}

/// Running counters shared by the dispatch tasks.
#[derive(Default)]
struct PoolTally {
    busy: AtomicU64,
    solved: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    samples: AtomicU64,
    solver_micros: AtomicU64,
}

impl PoolTally {
    fn record(&self, outcome: &ItemOutcome) {
        let duration = match outcome {
            ItemOutcome::Success(success) => {
                self.solved.fetch_add(1, Ordering::Relaxed);
                self.samples
                    .fetch_add(success.samples.len() as u64, Ordering::Relaxed);
                success.duration
            }
            ItemOutcome::Failure(failure) => {
                let counter = match failure.status {
                    ItemStatus::Timeout => &self.timed_out,
                    ItemStatus::Failed | ItemStatus::Panicked => &self.failed,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                failure.duration
            }
        };
        self.solver_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self, num_workers: usize) -> PoolStats {
        PoolStats {
            num_workers,
            busy_workers: self.busy.load(Ordering::Relaxed) as usize,
            items_solved: self.solved.load(Ordering::Relaxed),
            items_failed: self.failed.load(Ordering::Relaxed),
            items_timed_out: self.timed_out.load(Ordering::Relaxed),
            samples_returned: self.samples.load(Ordering::Relaxed),
            solver_time: Duration::from_micros(self.solver_micros.load(Ordering::Relaxed)),
        }
    }
}

/// Executes one combination's work items concurrently through the solver.
///
/// Workers only return samples; they never touch the output store.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    solver: Arc<dyn EquilibriumSolver>,
    context: Arc<SolverContext>,
    permits: Arc<Semaphore>,
    tally: Arc<PoolTally>,
    is_closed: AtomicBool,
}

impl WorkerPool {
    /// Creates a new worker pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NoWorkers` if `config.num_workers` is zero.
    pub fn new(
        config: WorkerPoolConfig,
        solver: Arc<dyn EquilibriumSolver>,
        context: Arc<SolverContext>,
    ) -> Result<Self, PoolError> {
        if config.num_workers == 0 {
            return Err(PoolError::NoWorkers);
        }

        info!(
            num_workers = config.num_workers,
            solver = solver.name(),
            item_timeout_secs = config.item_timeout.map(|t| t.as_secs_f64()),
            "Worker pool created"
        );

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.num_workers)),
            config,
            solver,
            context,
            tally: Arc::new(PoolTally::default()),
            is_closed: AtomicBool::new(false),
        })
    }

    /// Runs every item of one combination and waits for all of them.
    ///
    /// Results come back in completion order; callers that need a stable
    /// layout sort by [`ItemOutcome::index`].
    ///
    /// # Errors
    ///
    /// Returns `PoolError` when the batch as a whole cannot be executed.
    pub async fn execute_batch(
        &self,
        combination: &Combination,
        items: Vec<WorkItem>,
    ) -> Result<BatchOutcome, PoolError> {
        if self.is_closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        if let Some(stray) = items.iter().find(|item| &item.combination != combination) {
            return Err(PoolError::MixedBatch {
                expected: combination.to_string(),
                found: stray.combination.to_string(),
            });
        }

        let batch_size = items.len();
        debug!(combination = %combination, items = batch_size, "Dispatching batch");

        let mut join_set = JoinSet::new();
        for item in items {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|_| PoolError::Closed)?;

            let solver = Arc::clone(&self.solver);
            let context = Arc::clone(&self.context);
            let tally = Arc::clone(&self.tally);
            let limit = self.config.item_timeout;

            join_set.spawn(async move {
                let index = item.index;
                let point = item.point;
                let start_time = Instant::now();
                tally.busy.fetch_add(1, Ordering::Relaxed);

                let handle = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    let started = Instant::now();
                    let request = SolveRequest::new(item.combination.elements(), item.point)
                        .with_deadline(limit.map(|limit| started + limit));
                    let result = solver.solve(&context, &request).and_then(|samples| {
                        check_samples(&samples)?;
                        Ok(samples)
                    });
                    (result, started.elapsed())
                });

                let joined = handle.await;
                tally.busy.fetch_sub(1, Ordering::Relaxed);
                // A panicking call reports no timing of its own.
                let (joined, duration) = match joined {
                    Ok((result, elapsed)) => (Ok(result), elapsed),
                    Err(join_err) => (Err(join_err), start_time.elapsed()),
                };

                let failure = |status: ItemStatus, error: String| {
                    ItemOutcome::Failure(ItemFailure {
                        index,
                        point,
                        status,
                        error,
                        duration,
                    })
                };
                let overran = limit.filter(|limit| duration > *limit);

                let outcome = match (joined, overran) {
                    (Ok(Err(e @ SolverError::TimedOut(_))), _) => {
                        failure(ItemStatus::Timeout, e.to_string())
                    }
                    (Ok(Ok(_)), Some(limit)) => failure(
                        ItemStatus::Timeout,
                        format!("solver returned after {:?}, past the {:?} limit", duration, limit),
                    ),
                    (Ok(Ok(samples)), None) => ItemOutcome::Success(ItemSuccess {
                        index,
                        point,
                        samples,
                        duration,
                    }),
                    (Ok(Err(e)), _) => failure(ItemStatus::Failed, e.to_string()),
                    (Err(join_err), _) if join_err.is_panic() => {
                        failure(ItemStatus::Panicked, panic_message(join_err))
                    }
                    (Err(join_err), _) => failure(ItemStatus::Failed, join_err.to_string()),
                };

                tally.record(&outcome);
                outcome
            });
        }

        let mut outcome = BatchOutcome::new(combination.clone());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(item_outcome) => {
                    if let ItemOutcome::Failure(ref failure) = item_outcome {
                        warn!(
                            combination = %combination,
                            index = failure.index,
                            w_a = failure.point.w_a,
                            w_b = failure.point.w_b,
                            status = %failure.status,
                            error = %failure.error,
                            "Work item failed"
                        );
                    }
                    outcome.push(item_outcome);
                }
                Err(e) => {
                    join_set.abort_all();
                    return Err(PoolError::Join(e.to_string()));
                }
            }
        }

        debug!(
            combination = %combination,
            succeeded = outcome.successes.len(),
            failed = outcome.failures.len(),
            "Batch complete"
        );
        Ok(outcome)
    }

    /// Stops accepting batches. Calls already running finish normally.
    pub fn close(&self) {
        if !self.is_closed.swap(true, Ordering::SeqCst) {
            self.permits.close();
            let stats = self.stats();
            info!(
                items_solved = stats.items_solved,
                items_failed = stats.items_failed,
                items_timed_out = stats.items_timed_out,
                samples = stats.samples_returned,
                mean_solve_ms = stats.mean_solve_time().as_millis() as u64,
                "Worker pool closed"
            );
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.tally.snapshot(self.config.num_workers)
    }

    /// Returns whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<&str>() {
                format!("solver panicked: {}", s)
            } else if let Some(s) = payload.downcast_ref::<String>() {
                format!("solver panicked: {}", s)
            } else {
                "solver panicked".to_string()
            }
        }
        Err(err) => err.to_string(),
    }
}
