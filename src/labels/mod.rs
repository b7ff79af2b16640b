//! Integer encoding of phase labels.
//!
//! Classes are the sorted, de-duplicated phase names plus the empty label
//! used for unused phase slots, so the empty label always encodes as 0.
//! Every row gets exactly [`PHASE_SLOTS`] encoded columns.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::ExportError;
use crate::solver::PhaseDatabase;
use crate::storage::{OutputStore, ResultRecord};

/// Number of phase slots per encoded row.
pub const PHASE_SLOTS: usize = 3;

/// Maps phase names to dense indices in sorted order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelEncoder {
    classes: Vec<String>,
}

impl LabelEncoder {
    /// Fits the encoder on `labels` plus the empty label.
    pub fn fit<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut classes: BTreeSet<String> = labels
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .collect();
        classes.insert(String::new());
        Self {
            classes: classes.into_iter().collect(),
        }
    }

    pub fn from_database(database: &PhaseDatabase) -> Self {
        Self::fit(&database.phases)
    }

    /// Sorted classes; the position of a class is its code.
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn encode(&self, label: &str) -> Result<usize, ExportError> {
        let label = label.trim();
        self.classes
            .binary_search_by(|c| c.as_str().cmp(label))
            .map_err(|_| ExportError::UnknownLabel(label.to_string()))
    }

    pub fn transform<S: AsRef<str>>(&self, labels: &[S]) -> Result<Vec<usize>, ExportError> {
        labels.iter().map(|l| self.encode(l.as_ref())).collect()
    }

    /// Encodes a row's labels into exactly [`PHASE_SLOTS`] codes, padding with the empty label.
    pub fn transform_padded<S: AsRef<str>>(
        &self,
        labels: &[S],
    ) -> Result<[usize; PHASE_SLOTS], ExportError> {
        if labels.len() > PHASE_SLOTS {
            return Err(ExportError::TooManyPhases(labels.len()));
        }
        let empty = self.encode("")?;
        let mut codes = [empty; PHASE_SLOTS];
        for (slot, label) in codes.iter_mut().zip(labels) {
            *slot = self.encode(label.as_ref())?;
        }
        Ok(codes)
    }

    pub fn inverse(&self, code: usize) -> Option<&str> {
        self.classes.get(code).map(String::as_str)
    }
}

/// A result row with its phase labels encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedRecord {
    #[serde(flatten)]
    pub record: ResultRecord,
    pub encoded_phases: [usize; PHASE_SLOTS],
}

/// Totals of an encoding pass.
#[derive(Debug, Clone, Serialize)]
pub struct EncodeSummary {
    pub rows: usize,
    pub classes: Vec<String>,
}

/// Encodes every row of `store` and writes them as JSON Lines to `output`.
///
/// With `fit_observed`, labels present in the store but missing from the
/// database are added to the classes instead of failing the run.
pub async fn encode_store(
    store: &OutputStore,
    database: &PhaseDatabase,
    output: &Path,
    fit_observed: bool,
) -> Result<EncodeSummary, ExportError> {
    let records = store.read_records().await?;
    if records.is_empty() {
        return Err(ExportError::NoRows);
    }

    let encoder = if fit_observed {
        let observed = records.iter().flat_map(|r| r.phase_labels.iter());
        LabelEncoder::fit(database.phases.iter().chain(observed))
    } else {
        LabelEncoder::from_database(database)
    };

    let mut buf = Vec::new();
    for record in &records {
        let encoded_phases = encoder.transform_padded(&record.phase_labels)?;
        let encoded = EncodedRecord {
            record: record.clone(),
            encoded_phases,
        };
        serde_json::to_writer(&mut buf, &encoded)?;
        buf.push(b'\n');
    }

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(output).await?;
    file.write_all(&buf).await?;
    file.sync_all().await?;

    info!(
        rows = records.len(),
        classes = encoder.classes().len(),
        output = %output.display(),
        "Encoded phase labels"
    );
    Ok(EncodeSummary {
        rows: records.len(),
        classes: encoder.classes().to_vec(),
    })
}
