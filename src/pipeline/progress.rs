//! Background progress monitor for generation runs.
//!
//! Periodically logs how many combinations are done, how many rows were
//! written and how fast the run is going, so operators can follow multi-day
//! runs without counting individual log lines.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

/// Snapshot of run progress counters at a point in time.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// Combinations finished by this run (succeeded or failed).
    pub combinations_done: u64,
    /// Combinations that had at least one failure recorded.
    pub combinations_failed: u64,
    /// Work items that produced samples.
    pub items_succeeded: u64,
    /// Work items that failed.
    pub items_failed: u64,
    /// Rows appended to the output store.
    pub rows_written: u64,
    /// Wall-clock elapsed time since the monitor started.
    pub elapsed: Duration,
}

/// Shared atomic counters for run progress.
///
/// Cloned into the driver and incremented via `fetch_add`.
#[derive(Debug, Clone, Default)]
pub struct ProgressCounters {
    pub combinations_done: Arc<AtomicU64>,
    pub combinations_failed: Arc<AtomicU64>,
    pub items_succeeded: Arc<AtomicU64>,
    pub items_failed: Arc<AtomicU64>,
    pub rows_written: Arc<AtomicU64>,
}

impl ProgressCounters {
    /// Create a new set of zeroed progress counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a snapshot of the current counter values.
    pub fn snapshot(&self, start: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            combinations_done: self.combinations_done.load(Ordering::Relaxed),
            combinations_failed: self.combinations_failed.load(Ordering::Relaxed),
            items_succeeded: self.items_succeeded.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            elapsed: start.elapsed(),
        }
    }
}

/// A background task that periodically logs run progress.
///
/// Call [`ProgressMonitor::stop`] to cancel.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Start a background progress monitor that logs every `interval`.
    ///
    /// # Arguments
    ///
    /// * `counters` - Shared atomic counters incremented by the driver
    /// * `remaining` - Combinations this run intends to process
    /// * `interval` - How often to emit progress logs
    pub fn start(counters: ProgressCounters, remaining: u64, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let start = Instant::now();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = counters.snapshot(start);
                let pct = if remaining > 0 {
                    (snap.combinations_done as f64 / remaining as f64 * 100.0).min(100.0)
                } else {
                    100.0
                };

                let elapsed_secs = snap.elapsed.as_secs_f64();
                let per_hour = if elapsed_secs > 0.0 {
                    snap.combinations_done as f64 / elapsed_secs * 3600.0
                } else {
                    0.0
                };
                let eta_secs = if per_hour > 0.0 {
                    let left = remaining.saturating_sub(snap.combinations_done) as f64;
                    (left / per_hour * 3600.0) as u64
                } else {
                    0
                };

                tracing::info!(
                    combinations_done = snap.combinations_done,
                    combinations_failed = snap.combinations_failed,
                    remaining = remaining,
                    items_succeeded = snap.items_succeeded,
                    items_failed = snap.items_failed,
                    rows_written = snap.rows_written,
                    progress_pct = format!("{:.1}%", pct),
                    elapsed_secs = snap.elapsed.as_secs(),
                    combinations_per_hour = format!("{:.1}", per_hour),
                    eta_secs = eta_secs,
                    "Generation progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the background monitor to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "Progress monitor ended abnormally");
                }
            }
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
