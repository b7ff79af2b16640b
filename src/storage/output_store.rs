//! Append-only JSON Lines output store.
//!
//! One [`ResultRecord`] per line. Rows are self-describing, so no header is
//! ever written. The driver is the only writer: each combination lands in a
//! single `write_all` followed by `sync_data`, and the byte length after that
//! append is what the checkpoint remembers. Anything past that length when a
//! run resumes belongs to a combination that never finished and is cut off.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::solver::EquilibriumSample;
use crate::space::{Combination, ConcentrationPoint};

const TAIL_CHUNK: u64 = 8192;

/// One output row: one temperature of one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub temperature: f64,
    /// `(primary, solute_a, solute_b)`.
    pub elements: [String; 3],
    /// `(w_a, w_b)`.
    pub concentration: [f64; 2],
    /// `None` when the solver reported a non-finite energy.
    pub gibbs_energy: Option<f64>,
    pub phase_fractions: Vec<Option<f64>>,
    pub phase_labels: Vec<String>,
}

impl ResultRecord {
    pub fn from_sample(
        combination: &Combination,
        point: &ConcentrationPoint,
        sample: &EquilibriumSample,
    ) -> Self {
        Self {
            temperature: sample.temperature,
            elements: combination.symbols(),
            concentration: [point.w_a, point.w_b],
            gibbs_energy: finite(sample.gibbs_energy),
            phase_fractions: sample.phase_fractions.iter().copied().map(finite).collect(),
            phase_labels: sample.phase_labels.clone(),
        }
    }
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// Handle on the output file. Cheap to clone; holds no open descriptor.
#[derive(Debug, Clone)]
pub struct OutputStore {
    path: PathBuf,
}

impl OutputStore {
    /// Opens (creating if needed) the store and drops a trailing partial line.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let store = Self { path };
        store.repair_tail().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size in bytes.
    pub async fn len(&self) -> Result<u64, StoreError> {
        Ok(fs::metadata(&self.path).await?.len())
    }

    /// Appends `bytes` in one write and syncs. Returns the new length.
    pub async fn append(&self, bytes: &[u8]) -> Result<u64, StoreError> {
        let mut file = OpenOptions::new().append(true).open(&self.path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(file.metadata().await?.len())
    }

    /// Cuts the store back to `len` bytes. Returns how many bytes were removed.
    pub async fn truncate_to(&self, len: u64) -> Result<u64, StoreError> {
        let current = self.len().await?;
        if current <= len {
            return Ok(0);
        }
        let file = OpenOptions::new().write(true).open(&self.path).await?;
        file.set_len(len).await?;
        file.sync_all().await?;
        let removed = current - len;
        warn!(
            path = %self.path.display(),
            removed_bytes = removed,
            kept_bytes = len,
            "Dropped uncommitted rows from output store"
        );
        Ok(removed)
    }

    /// Reads every row. Used by export and encoding, not by the pipeline.
    pub async fn read_records(&self) -> Result<Vec<ResultRecord>, StoreError> {
        let file = File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();
        let mut line_no = 0usize;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| StoreError::Corrupt {
                path: self.path.display().to_string(),
                line: line_no,
                message: e.to_string(),
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Truncates after the last newline if the file does not end with one.
    async fn repair_tail(&self) -> Result<(), StoreError> {
        let mut file = OpenOptions::new().read(true).open(&self.path).await?;
        let len = file.metadata().await?.len();
        if len == 0 {
            return Ok(());
        }

        let mut last = [0u8; 1];
        file.seek(SeekFrom::Start(len - 1)).await?;
        file.read_exact(&mut last).await?;
        if last[0] == b'\n' {
            return Ok(());
        }

        let mut keep = 0u64;
        let mut end = len;
        while end > 0 {
            let start = end.saturating_sub(TAIL_CHUNK);
            let mut chunk = vec![0u8; (end - start) as usize];
            file.seek(SeekFrom::Start(start)).await?;
            file.read_exact(&mut chunk).await?;
            if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
                keep = start + pos as u64 + 1;
                break;
            }
            end = start;
        }
        drop(file);

        info!(
            path = %self.path.display(),
            partial_bytes = len - keep,
            "Output store ends with a partial row, truncating"
        );
        self.truncate_to(keep).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(t: f64) -> ResultRecord {
        ResultRecord {
            temperature: t,
            elements: ["AL".to_string(), "CU".to_string(), "FE".to_string()],
            concentration: [0.1, 0.2],
            gibbs_energy: Some(-1234.5),
            phase_fractions: vec![Some(1.0), None],
            phase_labels: vec!["LIQUID".to_string(), String::new()],
        }
    }

    fn encode(records: &[ResultRecord]) -> Vec<u8> {
        let mut buf = Vec::new();
        for r in records {
            serde_json::to_writer(&mut buf, r).unwrap();
            buf.push(b'\n');
        }
        buf
    }

    #[tokio::test]
    async fn test_open_creates_file_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out/results.jsonl");
        let store = OutputStore::open(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::open(dir.path().join("results.jsonl")).await.unwrap();

        let first = encode(&[record(300.0), record(320.0)]);
        let len = store.append(&first).await.unwrap();
        assert_eq!(len, first.len() as u64);

        let second = encode(&[record(340.0)]);
        let len = store.append(&second).await.unwrap();
        assert_eq!(len, (first.len() + second.len()) as u64);

        let rows = store.read_records().await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].temperature, 340.0);
        assert_eq!(rows[0].phase_fractions, vec![Some(1.0), None]);
    }

    #[tokio::test]
    async fn test_partial_tail_is_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let complete = encode(&[record(300.0)]);
        let mut content = complete.clone();
        content.extend_from_slice(br#"{"temperature":320.0,"elem"#);
        std::fs::write(&path, &content).unwrap();

        let store = OutputStore::open(&path).await.unwrap();
        assert_eq!(store.len().await.unwrap(), complete.len() as u64);
        assert_eq!(store.read_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_only_file_is_emptied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        std::fs::write(&path, b"{\"temperature\":3").unwrap();

        let store = OutputStore::open(&path).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_truncate_to() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::open(dir.path().join("results.jsonl")).await.unwrap();
        let committed = store.append(&encode(&[record(300.0)])).await.unwrap();
        store.append(&encode(&[record(320.0), record(340.0)])).await.unwrap();

        let removed = store.truncate_to(committed).await.unwrap();
        assert!(removed > 0);
        assert_eq!(store.read_records().await.unwrap().len(), 1);
        assert_eq!(store.truncate_to(committed + 100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_line_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let mut content = encode(&[record(300.0)]);
        content.extend_from_slice(b"garbage\n");
        std::fs::write(&path, &content).unwrap();

        let store = OutputStore::open(&path).await.unwrap();
        match store.read_records().await {
            Err(StoreError::Corrupt { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_non_finite_values_become_null() {
        let space = crate::space::CompositionSpace::new(
            crate::space::ElementCatalogue::new(["AL", "CU", "FE"]).unwrap(),
            &crate::space::GridSpec::default(),
        )
        .unwrap();
        let combo = space.combinations().next().unwrap();
        let sample = EquilibriumSample {
            temperature: 300.0,
            gibbs_energy: f64::NAN,
            phase_fractions: vec![0.5, f64::NAN],
            phase_labels: vec!["LIQUID".to_string(), String::new()],
        };
        let row = ResultRecord::from_sample(&combo, &ConcentrationPoint { w_a: 0.1, w_b: 0.2 }, &sample);
        assert_eq!(row.gibbs_energy, None);
        assert_eq!(row.phase_fractions, vec![Some(0.5), None]);
        assert_eq!(row.elements, ["AL", "CU", "FE"].map(String::from));

        let json = serde_json::to_string(&row).unwrap();
        let back: ResultRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }
}
