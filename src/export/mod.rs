//! Export of the output store into analysis-ready datasets.
//!
//! Provides Parquet export with optional de-duplication and phase encoding.

pub mod parquet_writer;

pub use parquet_writer::{
    dataset_schema, dedup_records, read_parquet, records_to_record_batch, write_parquet,
    DEFAULT_BATCH_ROWS,
};

use std::path::Path;

use serde::Serialize;

use crate::error::ExportError;
use crate::labels::LabelEncoder;
use crate::storage::OutputStore;

/// Options for [`export_store`].
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Drop repeated `(elements, concentration, temperature)` rows.
    pub dedup: bool,
    /// Append encoded phase columns.
    pub encoder: Option<LabelEncoder>,
    pub batch_rows: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            dedup: false,
            encoder: None,
            batch_rows: DEFAULT_BATCH_ROWS,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub rows_read: usize,
    pub duplicates_dropped: usize,
    pub rows_written: usize,
}

/// Converts the whole output store into one Parquet file.
pub async fn export_store(
    store: &OutputStore,
    output: &Path,
    options: ExportOptions,
) -> Result<ExportSummary, ExportError> {
    let mut records = store.read_records().await?;
    let rows_read = records.len();
    let duplicates_dropped = if options.dedup {
        dedup_records(&mut records)
    } else {
        0
    };
    if duplicates_dropped > 0 {
        tracing::warn!(duplicates = duplicates_dropped, "Dropped duplicate rows");
    }

    let output = output.to_path_buf();
    let rows_written = records.len();
    tokio::task::spawn_blocking(move || {
        write_parquet(&records, options.encoder.as_ref(), &output, options.batch_rows)
    })
    .await
    .map_err(|e| ExportError::Io(std::io::Error::other(e.to_string())))??;

    Ok(ExportSummary {
        rows_read,
        duplicates_dropped,
        rows_written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ResultRecord;

    fn record(t: f64) -> ResultRecord {
        ResultRecord {
            temperature: t,
            elements: ["AL".to_string(), "CU".to_string(), "FE".to_string()],
            concentration: [0.1, 0.2],
            gibbs_energy: Some(-t),
            phase_fractions: vec![Some(1.0)],
            phase_labels: vec!["LIQUID".to_string()],
        }
    }

    #[tokio::test]
    async fn test_export_store_with_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::open(dir.path().join("results.jsonl")).await.unwrap();
        let mut buf = Vec::new();
        for r in [record(300.0), record(320.0), record(300.0)] {
            serde_json::to_writer(&mut buf, &r).unwrap();
            buf.push(b'\n');
        }
        store.append(&buf).await.unwrap();

        let output = dir.path().join("dataset.parquet");
        let options = ExportOptions {
            dedup: true,
            ..ExportOptions::default()
        };
        let summary = export_store(&store, &output, options).await.unwrap();
        assert_eq!(summary.rows_read, 3);
        assert_eq!(summary.duplicates_dropped, 1);
        assert_eq!(summary.rows_written, 2);
        assert_eq!(read_parquet(&output).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_export_empty_store_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::open(dir.path().join("results.jsonl")).await.unwrap();
        let err = export_store(&store, &dir.path().join("x.parquet"), ExportOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::NoRows));
    }
}
