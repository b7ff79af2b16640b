//! Durable marker of the last finished combination.
//!
//! The checkpoint is overwritten after every combination and read once at
//! startup. It is only ever written after that combination's rows (or its
//! failure record) are durable, so it never points past missing data.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CheckpointError;
use crate::space::{Combination, CompositionSpace};

/// Last finished combination plus what is needed to validate it on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Fingerprint of the catalogue the rank refers to.
    pub catalogue_fingerprint: String,
    pub catalogue_len: usize,
    pub rank: u64,
    pub elements: [String; 3],
    /// Output store length once this combination was appended.
    pub store_len: u64,
    pub run_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(space: &CompositionSpace, combination: &Combination, store_len: u64, run_id: Uuid) -> Self {
        Self {
            catalogue_fingerprint: space.catalogue().fingerprint().to_string(),
            catalogue_len: space.catalogue().len(),
            rank: combination.rank(),
            elements: combination.symbols(),
            store_len,
            run_id,
            updated_at: Utc::now(),
        }
    }

    /// Confirms the checkpoint refers to this space and returns its combination.
    pub fn validate(&self, space: &CompositionSpace) -> Result<Combination, CheckpointError> {
        let fingerprint = space.catalogue().fingerprint();
        if self.catalogue_fingerprint != fingerprint || self.catalogue_len != space.catalogue().len() {
            return Err(CheckpointError::IncompatibleCatalogue {
                expected: fingerprint.to_string(),
                found: self.catalogue_fingerprint.clone(),
            });
        }

        let combination = space
            .combination_at(self.rank)
            .map_err(|e| CheckpointError::Mismatch(e.to_string()))?;
        if combination.symbols() != self.elements {
            return Err(CheckpointError::Mismatch(format!(
                "rank {} is {} but the checkpoint names {}",
                self.rank,
                combination,
                self.elements.join("-")
            )));
        }
        Ok(combination)
    }

    /// Builds a checkpoint from a plain-text marker such as `['LI', 'BE', 'NA']`.
    ///
    /// The store length is unknown for such markers, so it is taken from the
    /// current store and nothing is rolled back on resume.
    pub fn from_legacy_marker(
        marker: &str,
        space: &CompositionSpace,
        store_len: u64,
    ) -> Result<Self, CheckpointError> {
        let inner = marker
            .trim()
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(|| CheckpointError::InvalidLegacyMarker(marker.to_string()))?;

        let symbols: Vec<&str> = inner
            .split(',')
            .map(|s| s.trim().trim_matches(|c| c == '\'' || c == '"').trim())
            .collect();
        let [a, b, c] = symbols.as_slice() else {
            return Err(CheckpointError::InvalidLegacyMarker(marker.to_string()));
        };

        let combination = space.find([*a, *b, *c]).ok_or_else(|| {
            CheckpointError::InvalidLegacyMarker(format!("{} is not in the catalogue", inner))
        })?;
        Ok(Self::new(space, &combination, store_len, Uuid::nil()))
    }
}

/// Reads and atomically replaces the checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    path: PathBuf,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Writes to a temp file, syncs, then renames over the checkpoint.
    pub async fn record(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let parent = self.path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(parent) = parent {
            fs::create_dir_all(parent).await?;
        }

        let body = serde_json::to_vec_pretty(checkpoint)?;
        let temp = self.temp_path();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp)
            .await?;
        file.write_all(&body).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp, &self.path).await?;
        if let Some(parent) = parent {
            sync_dir(parent).await;
        }

        debug!(
            rank = checkpoint.rank,
            elements = %checkpoint.elements.join("-"),
            store_len = checkpoint.store_len,
            "Checkpoint written"
        );
        Ok(())
    }

    /// The recorded checkpoint, or `None` if no run has finished a combination.
    pub async fn last_completed(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the checkpoint so the next run starts from the beginning.
    pub async fn clear(&self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Flushes a rename in `dir` to disk. Failures are logged, not returned.
async fn sync_dir(dir: &Path) -> bool {
    let result = match File::open(dir).await {
        Ok(handle) => handle.sync_all().await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "Could not sync checkpoint directory");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{ElementCatalogue, GridSpec};

    fn space(symbols: &[&str]) -> CompositionSpace {
        CompositionSpace::new(
            ElementCatalogue::new(symbols.iter().copied()).unwrap(),
            &GridSpec::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("checkpoint.json"));
        assert!(manager.last_completed().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("state/checkpoint.json"));
        let space = space(&["AL", "CU", "FE", "NI", "TI"]);
        let combo = space.combination_at(6).unwrap();

        let checkpoint = Checkpoint::new(&space, &combo, 4096, Uuid::new_v4());
        manager.record(&checkpoint).await.unwrap();
        assert!(!manager.temp_path().exists());

        let loaded = manager.last_completed().await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
        assert_eq!(loaded.validate(&space).unwrap(), combo);

        let next = space.combination_at(7).unwrap();
        manager
            .record(&Checkpoint::new(&space, &next, 8192, Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(manager.last_completed().await.unwrap().unwrap().rank, 7);

        manager.clear().await.unwrap();
        assert!(manager.last_completed().await.unwrap().is_none());
        manager.clear().await.unwrap();
    }

    #[test]
    fn test_validate_rejects_other_catalogue() {
        let original = space(&["AL", "CU", "FE", "NI"]);
        let changed = space(&["AL", "CU", "FE", "NI", "TI"]);
        let combo = original.combination_at(1).unwrap();
        let checkpoint = Checkpoint::new(&original, &combo, 0, Uuid::nil());

        assert!(matches!(
            checkpoint.validate(&changed),
            Err(CheckpointError::IncompatibleCatalogue { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_tampered_elements() {
        let space = space(&["AL", "CU", "FE", "NI"]);
        let combo = space.combination_at(1).unwrap();
        let mut checkpoint = Checkpoint::new(&space, &combo, 0, Uuid::nil());
        checkpoint.elements[2] = "TI".to_string();
        assert!(matches!(checkpoint.validate(&space), Err(CheckpointError::Mismatch(_))));

        checkpoint.rank = 99;
        assert!(matches!(checkpoint.validate(&space), Err(CheckpointError::Mismatch(_))));
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        std::fs::write(&path, b"{not json").unwrap();
        let manager = CheckpointManager::new(&path);
        assert!(matches!(manager.last_completed().await, Err(CheckpointError::Json(_))));
    }

    #[test]
    fn test_legacy_marker() {
        let space = space(&["LI", "BE", "NA", "MG", "AL"]);
        let checkpoint = Checkpoint::from_legacy_marker("['LI', 'BE', 'MG']\n", &space, 10).unwrap();
        assert_eq!(checkpoint.rank, 1);
        assert_eq!(checkpoint.elements, ["LI", "BE", "MG"].map(String::from));
        assert_eq!(checkpoint.store_len, 10);
        assert!(checkpoint.validate(&space).is_ok());

        assert!(Checkpoint::from_legacy_marker("LI BE MG", &space, 0).is_err());
        assert!(Checkpoint::from_legacy_marker("['LI', 'BE']", &space, 0).is_err());
        assert!(Checkpoint::from_legacy_marker("['LI', 'BE', 'ZN']", &space, 0).is_err());
    }

    #[tokio::test]
    async fn test_directory_sync_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sync_dir(dir.path()).await);
        assert!(!sync_dir(&dir.path().join("missing")).await);
    }
}
