//! Append-only log of everything that went wrong during a run.
//!
//! Each line is one [`FailureRecord`]. The recorder itself never fails: if
//! the log cannot be written the failure is reported through `tracing` and
//! the pipeline carries on.
//!
//! The log is never rewritten. When a retry fixes a failure it appends a
//! [`FailureKind::Resolved`] marker, and [`unresolved`] replays the log to
//! find what is still outstanding.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::scheduler::ItemFailure;
use crate::space::{Combination, ConcentrationPoint};

/// Stage of the pipeline that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// One work item failed inside the solver (error, panic or timeout).
    Solver,
    /// The whole batch could not be dispatched.
    Dispatch,
    /// The batch came back but could not be merged.
    Aggregate,
    /// The merged rows could not be appended.
    Persist,
    /// Marker: a retry fixed the earlier failures at this rank and point.
    Resolved,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Solver => "solver",
            Self::Dispatch => "dispatch",
            Self::Aggregate => "aggregate",
            Self::Persist => "persist",
            Self::Resolved => "resolved",
        };
        f.write_str(name)
    }
}

/// One line of the failure log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub run_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub kind: FailureKind,
    pub rank: u64,
    pub elements: [String; 3],
    /// Set for item-level failures only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point: Option<ConcentrationPoint>,
    pub error: String,
}

impl FailureRecord {
    /// A failure affecting the whole combination.
    pub fn combination(
        run_id: Uuid,
        kind: FailureKind,
        combination: &Combination,
        error: impl fmt::Display,
    ) -> Self {
        Self {
            run_id,
            recorded_at: Utc::now(),
            kind,
            rank: combination.rank(),
            elements: combination.symbols(),
            point: None,
            error: error.to_string(),
        }
    }

    /// Marks earlier failures as fixed by a retry.
    ///
    /// With a point, item failures at that point are resolved; without one,
    /// the combination-level failures of the rank are.
    pub fn resolved(run_id: Uuid, combination: &Combination, point: Option<ConcentrationPoint>) -> Self {
        Self {
            run_id,
            recorded_at: Utc::now(),
            kind: FailureKind::Resolved,
            rank: combination.rank(),
            elements: combination.symbols(),
            point,
            error: String::new(),
        }
    }

    pub fn is_resolution(&self) -> bool {
        self.kind == FailureKind::Resolved
    }

    fn resolves(&self, earlier: &FailureRecord) -> bool {
        if !self.is_resolution() || earlier.is_resolution() {
            return false;
        }
        if self.rank != earlier.rank || self.elements != earlier.elements {
            return false;
        }
        match (&self.point, &earlier.point) {
            (Some(a), Some(b)) => a.approx_eq(b),
            (None, None) => true,
            _ => false,
        }
    }

    /// A single work item that did not produce samples.
    pub fn item(run_id: Uuid, combination: &Combination, failure: &ItemFailure) -> Self {
        Self {
            run_id,
            recorded_at: Utc::now(),
            kind: FailureKind::Solver,
            rank: combination.rank(),
            elements: combination.symbols(),
            point: Some(failure.point),
            error: format!("{}: {}", failure.status, failure.error),
        }
    }
}

/// Failures in log order that no later resolution marker covers.
///
/// A marker only resolves records written before it, so a failure that
/// recurs after a retry stays outstanding.
pub fn unresolved(records: &[FailureRecord]) -> Vec<&FailureRecord> {
    let mut pending: Vec<&FailureRecord> = Vec::new();
    for record in records {
        if record.is_resolution() {
            pending.retain(|earlier| !record.resolves(earlier));
        } else {
            pending.push(record);
        }
    }
    pending
}

/// Single writer of the failure log.
#[derive(Debug, Clone)]
pub struct ErrorRecorder {
    path: PathBuf,
    recorded: Arc<AtomicU64>,
}

impl ErrorRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            recorded: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records written by this recorder.
    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    /// Appends one record. Never fails.
    pub async fn record(&self, record: &FailureRecord) {
        self.record_all(std::slice::from_ref(record)).await;
    }

    /// Appends several records in one write. Never fails.
    pub async fn record_all(&self, records: &[FailureRecord]) {
        if records.is_empty() {
            return;
        }
        match self.append(records).await {
            Ok(()) => {
                self.recorded.fetch_add(records.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                for record in records {
                    error!(
                        path = %self.path.display(),
                        kind = %record.kind,
                        rank = record.rank,
                        elements = %record.elements.join("-"),
                        failure = %record.error,
                        error = %e,
                        "Could not write failure log"
                    );
                }
            }
        }
    }

    async fn append(&self, records: &[FailureRecord]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Loads every readable record. Malformed lines are skipped with a warning.
    pub async fn read_all(&self) -> Result<Vec<FailureRecord>, StoreError> {
        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();
        let mut line_no = 0usize;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = line_no,
                    error = %e,
                    "Skipping malformed failure record"
                ),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ItemStatus;
    use crate::space::{CompositionSpace, ElementCatalogue, GridSpec};
    use std::time::Duration;

    fn combo() -> Combination {
        let space = CompositionSpace::new(
            ElementCatalogue::new(["AL", "CU", "FE", "NI"]).unwrap(),
            &GridSpec::default(),
        )
        .unwrap();
        space.combination_at(2).unwrap()
    }

    #[tokio::test]
    async fn test_record_and_read_all() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ErrorRecorder::new(dir.path().join("logs/failures.jsonl"));
        let run_id = Uuid::new_v4();
        let combo = combo();

        recorder
            .record(&FailureRecord::combination(
                run_id,
                FailureKind::Dispatch,
                &combo,
                "pool closed",
            ))
            .await;

        let failure = ItemFailure {
            index: 3,
            point: ConcentrationPoint { w_a: 0.1, w_b: 0.4 },
            status: ItemStatus::Timeout,
            error: "exceeded 5s".to_string(),
            duration: Duration::from_secs(5),
        };
        recorder
            .record_all(&[FailureRecord::item(run_id, &combo, &failure)])
            .await;

        assert_eq!(recorder.recorded(), 2);
        let records = recorder.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, FailureKind::Dispatch);
        assert_eq!(records[0].point, None);
        assert_eq!(records[0].rank, 2);
        assert_eq!(records[1].kind, FailureKind::Solver);
        assert_eq!(records[1].point, Some(ConcentrationPoint { w_a: 0.1, w_b: 0.4 }));
        assert!(records[1].error.starts_with("timeout"));
        assert_eq!(records[1].elements, combo.symbols());
    }

    #[tokio::test]
    async fn test_read_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ErrorRecorder::new(dir.path().join("failures.jsonl"));
        assert!(recorder.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures.jsonl");
        let recorder = ErrorRecorder::new(&path);
        recorder
            .record(&FailureRecord::combination(
                Uuid::nil(),
                FailureKind::Persist,
                &combo(),
                "disk full",
            ))
            .await;

        let mut content = std::fs::read(&path).unwrap();
        content.extend_from_slice(b"{broken\n");
        std::fs::write(&path, content).unwrap();

        let records = recorder.read_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, FailureKind::Persist);
    }

    #[tokio::test]
    async fn test_unwritable_log_does_not_fail() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the log file should be makes every append fail.
        let path = dir.path().join("failures.jsonl");
        std::fs::create_dir(&path).unwrap();

        let recorder = ErrorRecorder::new(&path);
        recorder
            .record(&FailureRecord::combination(
                Uuid::nil(),
                FailureKind::Aggregate,
                &combo(),
                "duplicate item",
            ))
            .await;
        assert_eq!(recorder.recorded(), 0);
    }

    #[test]
    fn test_resolution_markers_clear_earlier_failures_only() {
        let combo = combo();
        let run_id = Uuid::new_v4();
        let point = |w_a, w_b| ConcentrationPoint { w_a, w_b };
        let item = |p: ConcentrationPoint| {
            FailureRecord::item(
                run_id,
                &combo,
                &ItemFailure {
                    index: 0,
                    point: p,
                    status: ItemStatus::Failed,
                    error: "no convergence".to_string(),
                    duration: Duration::from_millis(1),
                },
            )
        };

        let records = vec![
            item(point(0.1, 0.2)),
            item(point(0.3, 0.3)),
            FailureRecord::combination(run_id, FailureKind::Dispatch, &combo, "pool closed"),
            FailureRecord::resolved(run_id, &combo, Some(point(0.1 + 1e-12, 0.2))),
            FailureRecord::resolved(run_id, &combo, None),
            // Fails again after the marker.
            item(point(0.1, 0.2)),
        ];

        let pending = unresolved(&records);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].point, Some(point(0.3, 0.3)));
        assert_eq!(pending[1].point, Some(point(0.1, 0.2)));
        assert!(pending.iter().all(|r| r.kind == FailureKind::Solver));
    }

    #[tokio::test]
    async fn test_resolution_marker_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ErrorRecorder::new(dir.path().join("failures.jsonl"));
        recorder
            .record(&FailureRecord::resolved(Uuid::nil(), &combo(), None))
            .await;

        let records = recorder.read_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_resolution());
        assert_eq!(records[0].point, None);
        assert!(unresolved(&records).is_empty());
    }
}
