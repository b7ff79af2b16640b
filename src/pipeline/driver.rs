//! The generation control loop.
//!
//! ```text
//! Init -> ResumeScan -> (Dispatch -> Aggregate -> Checkpoint)* -> Done
//! ```
//!
//! A combination's rows are durable before its checkpoint is written, and a
//! failure is logged before the checkpoint moves past it. Item failures,
//! dispatch failures and aggregation failures are recorded and the run moves
//! on. A persistence failure is recorded and stops the run with the
//! checkpoint still on the previous combination.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{CheckpointError, StoreError};
use crate::scheduler::{PoolError, WorkItemBuilder, WorkerPool};
use crate::solver::EquilibriumSolver;
use crate::space::{Combination, CompositionSpace, ConcentrationPoint, SpaceError};
use crate::storage::{
    Checkpoint, CheckpointManager, ErrorRecorder, FailureKind, FailureRecord, OutputStore,
    ResultAggregator,
};

use super::config::{ConfigError, PipelineConfig};
use super::progress::{ProgressCounters, ProgressMonitor};
use super::retry::{plan_retry, RetryFilter, RetryTarget};

/// Errors that stop a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Composition space error: {0}")]
    Space(#[from] SpaceError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Output store error: {0}")]
    Store(#[from] StoreError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Could not persist results of {combination}: {source}")]
    Persist {
        combination: String,
        #[source]
        source: StoreError,
    },
}

/// Where the driver is in its control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Init,
    ResumeScan,
    Dispatch,
    Aggregate,
    Checkpoint,
    Done,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::ResumeScan => "resume_scan",
            Self::Dispatch => "dispatch",
            Self::Aggregate => "aggregate",
            Self::Checkpoint => "checkpoint",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Cooperative stop request, checked between combinations.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Requests a stop on the first Ctrl-C and exits the process on the second.
    pub fn listen_for_ctrl_c(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            warn!("Interrupt received, stopping after the current combination (Ctrl-C again to abort)");
            handle.request();

            if tokio::signal::ctrl_c().await.is_ok() {
                error!("Second interrupt received, aborting");
                std::process::exit(130);
            }
        });
    }
}

/// What happened to one combination.
#[derive(Debug, Clone, Default)]
struct CombinationReport {
    rows: usize,
    items_succeeded: usize,
    items_failed: usize,
    /// Dispatch or aggregation failed; nothing was written.
    batch_failed: bool,
    /// Points whose rows are now in the store.
    persisted: Vec<ConcentrationPoint>,
}

/// Totals for one `run` or `reprocess` call.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub total_combinations: u64,
    /// Rank of the checkpoint the run resumed after.
    pub resumed_from: Option<u64>,
    /// Combinations finished by this call.
    pub processed: u64,
    /// Combinations with every item successful.
    pub succeeded: u64,
    /// Combinations with a batch-level failure.
    pub failed: u64,
    pub item_failures: u64,
    pub rows_written: u64,
    /// Rank of the last finished combination.
    pub last_rank: Option<u64>,
    /// The run stopped on a shutdown request.
    pub interrupted: bool,
    /// No combinations remain after this run.
    pub complete: bool,
}

impl RunSummary {
    fn new(run_id: Uuid, total_combinations: u64) -> Self {
        Self {
            run_id,
            total_combinations,
            resumed_from: None,
            processed: 0,
            succeeded: 0,
            failed: 0,
            item_failures: 0,
            rows_written: 0,
            last_rank: None,
            interrupted: false,
            complete: false,
        }
    }

    fn add(&mut self, rank: u64, report: &CombinationReport) {
        self.processed += 1;
        self.last_rank = Some(rank);
        self.rows_written += report.rows as u64;
        self.item_failures += report.items_failed as u64;
        if report.batch_failed {
            self.failed += 1;
        } else if report.items_failed == 0 {
            self.succeeded += 1;
        }
    }
}

/// Top-level control loop of a generation run.
pub struct PipelineDriver {
    run_id: Uuid,
    space: CompositionSpace,
    pool: WorkerPool,
    aggregator: ResultAggregator,
    checkpoints: CheckpointManager,
    recorder: ErrorRecorder,
    legacy_marker: Option<PathBuf>,
    limit: Option<u64>,
    progress_interval: Duration,
    counters: ProgressCounters,
    shutdown: ShutdownHandle,
    state: DriverState,
    /// Store length covered by the last checkpoint or append of this run.
    committed_len: u64,
}

impl PipelineDriver {
    /// Builds the driver with the solver selected in the configuration.
    pub async fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        Self::with_solver(config, config.build_solver()).await
    }

    /// Builds the driver around an explicit solver.
    pub async fn with_solver(
        config: &PipelineConfig,
        solver: Arc<dyn EquilibriumSolver>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let run_id = Uuid::new_v4();
        let space = config.composition_space()?;
        let context = Arc::new(config.solver_context()?);
        let pool = WorkerPool::new(config.worker_pool_config(), solver, context)?;
        let store = OutputStore::open(&config.output_path).await?;

        info!(
            run_id = %run_id,
            state = %DriverState::Init,
            elements = space.catalogue().len(),
            combinations = space.len(),
            grid_points = space.concentration_grid().len(),
            temperatures = config.sweep.temperatures().len(),
            output = %config.output_path.display(),
            "Pipeline initialised"
        );

        Ok(Self {
            run_id,
            space,
            pool,
            aggregator: ResultAggregator::new(store),
            checkpoints: CheckpointManager::new(&config.checkpoint_path),
            recorder: ErrorRecorder::new(&config.failure_log_path),
            legacy_marker: config.legacy_marker.clone(),
            limit: config.limit,
            progress_interval: config.progress_interval(),
            counters: ProgressCounters::new(),
            shutdown: ShutdownHandle::default(),
            state: DriverState::Init,
            committed_len: 0,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn space(&self) -> &CompositionSpace {
        &self.space
    }

    /// Handle for requesting a stop at the next combination boundary.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn counters(&self) -> &ProgressCounters {
        &self.counters
    }

    fn transition(&mut self, next: DriverState) {
        debug!(from = %self.state, to = %next, "Driver state change");
        self.state = next;
    }

    /// Processes every combination after the checkpoint, in canonical order.
    pub async fn run(&mut self) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::new(self.run_id, self.space.len());

        self.transition(DriverState::ResumeScan);
        let resumed = self.resume_scan().await?;
        summary.resumed_from = resumed.as_ref().map(|c| c.rank);

        let start_rank = resumed.as_ref().map_or(0, |c| c.rank + 1);
        let mut remaining = self.space.len().saturating_sub(start_rank);
        if let Some(limit) = self.limit {
            remaining = remaining.min(limit);
        }
        info!(
            run_id = %self.run_id,
            resumed_from = ?summary.resumed_from,
            start_rank = start_rank,
            remaining = remaining,
            "Starting generation"
        );

        let monitor = ProgressMonitor::start(self.counters.clone(), remaining, self.progress_interval);
        let result = self.process_remaining(resumed.map(|c| c.rank), &mut summary).await;
        monitor.stop().await;
        result?;

        self.transition(DriverState::Done);
        summary.complete = summary
            .last_rank
            .or(summary.resumed_from)
            .map_or(self.space.is_empty(), |rank| rank + 1 >= self.space.len());

        let stats = self.pool.stats();
        info!(
            run_id = %self.run_id,
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            item_failures = summary.item_failures,
            rows_written = summary.rows_written,
            interrupted = summary.interrupted,
            complete = summary.complete,
            item_success_pct = format!("{:.1}", stats.success_rate()),
            items_timed_out = stats.items_timed_out,
            samples_per_item = format!("{:.1}", stats.samples_per_item()),
            mean_solve_ms = stats.mean_solve_time().as_millis() as u64,
            "Generation finished"
        );
        Ok(summary)
    }

    async fn process_remaining(
        &mut self,
        after: Option<u64>,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        let space = self.space.clone();
        for combination in space.combinations_after(after)? {
            if self.shutdown.is_requested() {
                info!(next_rank = combination.rank(), "Shutdown requested, stopping at combination boundary");
                summary.interrupted = true;
                break;
            }
            if self.limit.is_some_and(|limit| summary.processed >= limit) {
                info!(limit = summary.processed, "Combination limit reached");
                break;
            }

            let report = self.process_combination(&combination, None).await?;

            self.transition(DriverState::Checkpoint);
            let checkpoint = Checkpoint::new(&self.space, &combination, self.committed_len, self.run_id);
            self.checkpoints.record(&checkpoint).await?;

            summary.add(combination.rank(), &report);
            self.count(&report);
            info!(
                rank = combination.rank(),
                combination = %combination,
                rows = report.rows,
                items_failed = report.items_failed,
                batch_failed = report.batch_failed,
                "Combination finished"
            );
        }
        Ok(())
    }

    /// Reads and validates the checkpoint and rolls back uncommitted rows.
    ///
    /// Imports the legacy marker when there is no checkpoint yet.
    async fn resume_scan(&mut self) -> Result<Option<Checkpoint>, PipelineError> {
        let store = self.aggregator.store().clone();
        let store_len = store.len().await?;

        let checkpoint = match self.checkpoints.last_completed().await? {
            Some(checkpoint) => Some(checkpoint),
            None => self.import_legacy_marker(store_len).await?,
        };

        let Some(checkpoint) = checkpoint else {
            if store_len > 0 {
                warn!(
                    path = %store.path().display(),
                    bytes = store_len,
                    "Output store has rows but no checkpoint; keeping them and starting from the first combination"
                );
            }
            self.committed_len = store_len;
            return Ok(None);
        };

        let combination = checkpoint.validate(&self.space)?;
        if store_len < checkpoint.store_len {
            return Err(CheckpointError::Mismatch(format!(
                "checkpoint covers {} bytes of output but the store has only {}",
                checkpoint.store_len, store_len
            ))
            .into());
        }
        store.truncate_to(checkpoint.store_len).await?;
        self.committed_len = checkpoint.store_len;

        info!(
            rank = checkpoint.rank,
            combination = %combination,
            store_len = checkpoint.store_len,
            last_run = %checkpoint.run_id,
            "Resuming after checkpoint"
        );
        Ok(Some(checkpoint))
    }

    async fn import_legacy_marker(&self, store_len: u64) -> Result<Option<Checkpoint>, PipelineError> {
        let Some(path) = &self.legacy_marker else {
            return Ok(None);
        };
        let marker = match tokio::fs::read_to_string(path).await {
            Ok(marker) => marker,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CheckpointError::Io(e).into()),
        };

        let checkpoint = Checkpoint::from_legacy_marker(&marker, &self.space, store_len)?;
        self.checkpoints.record(&checkpoint).await?;
        info!(
            marker = %path.display(),
            rank = checkpoint.rank,
            elements = %checkpoint.elements.join("-"),
            "Imported legacy progress marker"
        );
        Ok(Some(checkpoint))
    }

    /// Dispatch and aggregate one combination.
    ///
    /// `Ok` means the combination is finished, possibly with failures recorded.
    /// `Err` is a persistence failure; the caller must not checkpoint.
    async fn process_combination(
        &mut self,
        combination: &Combination,
        retry: Option<&RetryTarget>,
    ) -> Result<CombinationReport, PipelineError> {
        self.transition(DriverState::Dispatch);
        let mut items = WorkItemBuilder::new(self.space.concentration_grid()).build(combination);
        if let Some(target) = retry {
            items = target.select(items);
        }

        let mut report = CombinationReport::default();
        let outcome = match self.pool.execute_batch(combination, items).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(combination = %combination, error = %e, "Dispatch failed");
                self.recorder
                    .record(&FailureRecord::combination(self.run_id, FailureKind::Dispatch, combination, &e))
                    .await;
                report.batch_failed = true;
                return Ok(report);
            }
        };

        report.items_succeeded = outcome.successes.len();
        report.items_failed = outcome.failures.len();
        if !outcome.failures.is_empty() {
            let mut failures = outcome.failures.clone();
            failures.sort_by_key(|f| f.index);
            let records: Vec<FailureRecord> = failures
                .iter()
                .map(|f| FailureRecord::item(self.run_id, combination, f))
                .collect();
            self.recorder.record_all(&records).await;
        }

        self.transition(DriverState::Aggregate);
        let prepared = match self.aggregator.merge(combination, &outcome) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(combination = %combination, error = %e, "Aggregation failed");
                self.recorder
                    .record(&FailureRecord::combination(self.run_id, FailureKind::Aggregate, combination, &e))
                    .await;
                report.batch_failed = true;
                return Ok(report);
            }
        };

        match self.aggregator.persist(prepared).await {
            Ok(receipt) => {
                report.rows = receipt.rows;
                report.persisted = outcome.successes.iter().map(|s| s.point).collect();
                self.committed_len = receipt.store_len;
                Ok(report)
            }
            Err(e) => {
                error!(combination = %combination, error = %e, "Persisting results failed, stopping");
                self.recorder
                    .record(&FailureRecord::combination(self.run_id, FailureKind::Persist, combination, &e))
                    .await;
                Err(PipelineError::Persist {
                    combination: combination.to_string(),
                    source: e,
                })
            }
        }
    }

    fn count(&self, report: &CombinationReport) {
        self.counters.combinations_done.fetch_add(1, Ordering::Relaxed);
        if report.batch_failed || report.items_failed > 0 {
            self.counters.combinations_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .items_succeeded
            .fetch_add(report.items_succeeded as u64, Ordering::Relaxed);
        self.counters
            .items_failed
            .fetch_add(report.items_failed as u64, Ordering::Relaxed);
        self.counters
            .rows_written
            .fetch_add(report.rows as u64, Ordering::Relaxed);
    }

    /// Plans a retry from the failure log and the current checkpoint.
    pub async fn pending_retries(&self, filter: &RetryFilter) -> Result<Vec<RetryTarget>, PipelineError> {
        let records = self.recorder.read_all().await?;
        let completed_through = self.checkpoints.last_completed().await?.map(|c| c.rank);
        let targets = plan_retry(&self.space, &records, filter, completed_through);
        info!(
            failure_records = records.len(),
            completed_through = ?completed_through,
            targets = targets.len(),
            "Planned retry"
        );
        Ok(targets)
    }

    /// Runs specific combinations again without moving the checkpoint.
    ///
    /// Rows are appended to the store and the checkpoint's covered store
    /// length is extended so the next resume keeps them. Targets past the
    /// checkpoint are skipped, since generation will process them anyway.
    /// Every retried point that lands in the store gets a resolution marker
    /// in the failure log.
    pub async fn reprocess(&mut self, targets: &[RetryTarget]) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::new(self.run_id, self.space.len());

        self.transition(DriverState::ResumeScan);
        let mut checkpoint = self.resume_scan().await?;
        summary.resumed_from = checkpoint.as_ref().map(|c| c.rank);

        info!(run_id = %self.run_id, targets = targets.len(), "Reprocessing failed combinations");
        for target in targets {
            if self.shutdown.is_requested() {
                summary.interrupted = true;
                break;
            }
            let Some(checkpoint) = checkpoint.as_mut().filter(|c| target.rank <= c.rank) else {
                warn!(
                    rank = target.rank,
                    checkpoint = ?summary.resumed_from,
                    "Skipping retry target that generation has not reached"
                );
                continue;
            };
            let combination = match self.space.combination_at(target.rank) {
                Ok(combination) => combination,
                Err(e) => {
                    warn!(rank = target.rank, error = %e, "Skipping retry target");
                    continue;
                }
            };

            let report = self.process_combination(&combination, Some(target)).await?;

            if report.rows > 0 {
                self.transition(DriverState::Checkpoint);
                checkpoint.store_len = self.committed_len;
                checkpoint.updated_at = chrono::Utc::now();
                self.checkpoints.record(checkpoint).await?;
            }
            self.record_resolutions(&combination, target, &report).await;

            summary.add(combination.rank(), &report);
            self.count(&report);
            info!(
                rank = combination.rank(),
                combination = %combination,
                rows = report.rows,
                items_failed = report.items_failed,
                "Combination reprocessed"
            );
        }

        self.transition(DriverState::Done);
        summary.last_rank = checkpoint.as_ref().map(|c| c.rank);
        info!(
            run_id = %self.run_id,
            processed = summary.processed,
            rows_written = summary.rows_written,
            item_failures = summary.item_failures,
            "Reprocessing finished"
        );
        Ok(summary)
    }

    /// Marks what a retry fixed. Only called once the rows are checkpointed.
    async fn record_resolutions(
        &self,
        combination: &Combination,
        target: &RetryTarget,
        report: &CombinationReport,
    ) {
        let mut markers: Vec<FailureRecord> = report
            .persisted
            .iter()
            .map(|point| FailureRecord::resolved(self.run_id, combination, Some(*point)))
            .collect();
        if target.points.is_none() && !report.batch_failed {
            markers.push(FailureRecord::resolved(self.run_id, combination, None));
        }
        self.recorder.record_all(&markers).await;
    }
}
