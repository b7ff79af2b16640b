//! Read-only view of a run's durable state.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::storage::{unresolved, CheckpointManager, ErrorRecorder, FailureKind};

use super::config::PipelineConfig;
use super::driver::PipelineError;

/// Progress and failure counts as recorded on disk.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub total_combinations: u64,
    pub completed_combinations: u64,
    pub remaining_combinations: u64,
    pub last_rank: Option<u64>,
    pub last_elements: Option<[String; 3]>,
    pub store_bytes: u64,
    /// Bytes past the checkpoint that the next resume will drop.
    pub uncommitted_bytes: u64,
    /// Outstanding failures, by kind.
    pub failures_by_kind: BTreeMap<String, usize>,
    /// Distinct combinations with at least one outstanding failure.
    pub failed_combinations: usize,
    /// Failures a retry has since fixed.
    pub resolved_failures: usize,
}

impl RunStatus {
    /// Reads the checkpoint, the failure log and the store size.
    ///
    /// A checkpoint from another catalogue is an error, as it is for a run.
    pub async fn collect(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let space = config.composition_space()?;
        let checkpoint = CheckpointManager::new(&config.checkpoint_path)
            .last_completed()
            .await?;
        if let Some(checkpoint) = &checkpoint {
            checkpoint.validate(&space)?;
        }

        let store_bytes = match tokio::fs::metadata(&config.output_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(crate::error::StoreError::Io(e).into()),
        };

        let failures = ErrorRecorder::new(&config.failure_log_path).read_all().await?;
        let outstanding = unresolved(&failures);
        let recorded = failures.iter().filter(|f| !f.is_resolution()).count();
        let mut failures_by_kind = BTreeMap::new();
        let mut failed_ranks = BTreeSet::new();
        for failure in &outstanding {
            *failures_by_kind.entry(failure.kind.to_string()).or_insert(0) += 1;
            failed_ranks.insert(failure.rank);
        }
        for kind in [
            FailureKind::Solver,
            FailureKind::Dispatch,
            FailureKind::Aggregate,
            FailureKind::Persist,
        ] {
            failures_by_kind.entry(kind.to_string()).or_insert(0);
        }

        let completed = checkpoint.as_ref().map_or(0, |c| c.rank + 1);
        Ok(Self {
            total_combinations: space.len(),
            completed_combinations: completed,
            remaining_combinations: space.len().saturating_sub(completed),
            last_rank: checkpoint.as_ref().map(|c| c.rank),
            last_elements: checkpoint.as_ref().map(|c| c.elements.clone()),
            store_bytes,
            uncommitted_bytes: checkpoint
                .as_ref()
                .map_or(0, |c| store_bytes.saturating_sub(c.store_len)),
            failures_by_kind,
            failed_combinations: failed_ranks.len(),
            resolved_failures: recorded - outstanding.len(),
        })
    }

    pub fn progress_pct(&self) -> f64 {
        if self.total_combinations == 0 {
            return 100.0;
        }
        self.completed_combinations as f64 / self.total_combinations as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{CompositionSpace, ElementCatalogue, GridSpec};
    use crate::storage::{Checkpoint, FailureRecord};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_status_of_fresh_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::new()
            .with_elements(["AL", "CU", "FE", "NI", "TI"])
            .with_data_dir(dir.path());

        let status = RunStatus::collect(&config).await.unwrap();
        assert_eq!(status.total_combinations, 10);
        assert_eq!(status.completed_combinations, 0);
        assert_eq!(status.store_bytes, 0);
        assert_eq!(status.failures_by_kind["solver"], 0);
        assert_eq!(status.progress_pct(), 0.0);
    }

    #[tokio::test]
    async fn test_status_reads_checkpoint_and_failures() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::new()
            .with_elements(["AL", "CU", "FE", "NI", "TI"])
            .with_data_dir(dir.path());
        let space = CompositionSpace::new(
            ElementCatalogue::new(["AL", "CU", "FE", "NI", "TI"]).unwrap(),
            &GridSpec::default(),
        )
        .unwrap();

        std::fs::write(&config.output_path, b"0123456789").unwrap();
        let combo = space.combination_at(4).unwrap();
        CheckpointManager::new(&config.checkpoint_path)
            .record(&Checkpoint::new(&space, &combo, 6, Uuid::nil()))
            .await
            .unwrap();
        let recorder = ErrorRecorder::new(&config.failure_log_path);
        recorder
            .record(&FailureRecord::combination(Uuid::nil(), FailureKind::Dispatch, &combo, "x"))
            .await;

        let status = RunStatus::collect(&config).await.unwrap();
        assert_eq!(status.completed_combinations, 5);
        assert_eq!(status.remaining_combinations, 5);
        assert_eq!(status.last_rank, Some(4));
        assert_eq!(status.uncommitted_bytes, 4);
        assert_eq!(status.failures_by_kind["dispatch"], 1);
        assert_eq!(status.failed_combinations, 1);
        assert_eq!(status.resolved_failures, 0);
        assert_eq!(status.progress_pct(), 50.0);

        recorder
            .record(&FailureRecord::resolved(Uuid::nil(), &combo, None))
            .await;
        let status = RunStatus::collect(&config).await.unwrap();
        assert_eq!(status.failures_by_kind["dispatch"], 0);
        assert_eq!(status.failed_combinations, 0);
        assert_eq!(status.resolved_failures, 1);
        assert!(!status.failures_by_kind.contains_key("resolved"));
    }
}
