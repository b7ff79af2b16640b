//! Merges one combination's batch into rows and appends them atomically.
//!
//! Merging and writing are separate steps so the driver can tell an
//! aggregation fault (nothing touched the disk) from a persistence fault
//! (the append itself failed).

use std::collections::HashSet;

use tracing::debug;

use crate::error::{AggregateError, StoreError};
use crate::scheduler::BatchOutcome;
use crate::space::Combination;

use super::output_store::{OutputStore, ResultRecord};

/// Rows of one combination, serialized and ready for a single append.
#[derive(Debug, Clone)]
pub struct PreparedAppend {
    pub combination: Combination,
    pub rows: usize,
    bytes: Vec<u8>,
}

impl PreparedAppend {
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }
}

/// Result of a completed append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendReceipt {
    pub rows: usize,
    /// Store length after the append; what the checkpoint records.
    pub store_len: u64,
}

/// Sole writer of the output store.
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    store: OutputStore,
}

impl ResultAggregator {
    pub fn new(store: OutputStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &OutputStore {
        &self.store
    }

    /// Orders successes by item index and encodes every row into one buffer.
    pub fn merge(
        &self,
        combination: &Combination,
        outcome: &BatchOutcome,
    ) -> Result<PreparedAppend, AggregateError> {
        if &outcome.combination != combination {
            return Err(AggregateError::WrongCombination {
                expected: combination.to_string(),
                found: outcome.combination.to_string(),
            });
        }

        let mut seen = HashSet::new();
        for index in outcome
            .successes
            .iter()
            .map(|s| s.index)
            .chain(outcome.failures.iter().map(|f| f.index))
        {
            if !seen.insert(index) {
                return Err(AggregateError::DuplicateItem(index));
            }
        }

        let mut successes: Vec<_> = outcome.successes.iter().collect();
        successes.sort_by_key(|s| s.index);

        let mut bytes = Vec::new();
        let mut rows = 0usize;
        for success in successes {
            for sample in &success.samples {
                let record = ResultRecord::from_sample(combination, &success.point, sample);
                serde_json::to_writer(&mut bytes, &record)?;
                bytes.push(b'\n');
                rows += 1;
            }
        }

        Ok(PreparedAppend {
            combination: combination.clone(),
            rows,
            bytes,
        })
    }

    /// Writes a prepared combination in one append. Empty batches write nothing.
    pub async fn persist(&self, prepared: PreparedAppend) -> Result<AppendReceipt, StoreError> {
        if prepared.rows == 0 {
            return Ok(AppendReceipt {
                rows: 0,
                store_len: self.store.len().await?,
            });
        }

        let store_len = self.store.append(&prepared.bytes).await?;
        debug!(
            combination = %prepared.combination,
            rows = prepared.rows,
            bytes = prepared.bytes.len(),
            store_len = store_len,
            "Appended combination to output store"
        );
        Ok(AppendReceipt {
            rows: prepared.rows,
            store_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{ItemFailure, ItemStatus, ItemSuccess};
    use crate::solver::EquilibriumSample;
    use crate::space::{CompositionSpace, ConcentrationPoint, ElementCatalogue, GridSpec};
    use std::time::Duration;

    fn combos() -> (Combination, Combination) {
        let space = CompositionSpace::new(
            ElementCatalogue::new(["AL", "CU", "FE", "NI"]).unwrap(),
            &GridSpec::default(),
        )
        .unwrap();
        let mut iter = space.combinations();
        (iter.next().unwrap(), iter.next().unwrap())
    }

    fn success(index: usize, temps: &[f64]) -> ItemSuccess {
        ItemSuccess {
            index,
            point: ConcentrationPoint {
                w_a: 0.1 * (index + 1) as f64,
                w_b: 0.1,
            },
            samples: temps
                .iter()
                .map(|t| EquilibriumSample {
                    temperature: *t,
                    gibbs_energy: -t,
                    phase_fractions: vec![1.0],
                    phase_labels: vec!["LIQUID".to_string()],
                })
                .collect(),
            duration: Duration::ZERO,
        }
    }

    async fn aggregator(dir: &tempfile::TempDir) -> ResultAggregator {
        ResultAggregator::new(OutputStore::open(dir.path().join("results.jsonl")).await.unwrap())
    }

    #[tokio::test]
    async fn test_merge_orders_by_item_index() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(&dir).await;
        let (combo, _) = combos();

        let mut outcome = BatchOutcome::new(combo.clone());
        outcome.successes.push(success(2, &[300.0, 320.0]));
        outcome.successes.push(success(0, &[300.0, 320.0]));
        outcome.failures.push(ItemFailure {
            index: 1,
            point: ConcentrationPoint { w_a: 0.2, w_b: 0.1 },
            status: ItemStatus::Failed,
            error: "boom".to_string(),
            duration: Duration::ZERO,
        });

        let prepared = agg.merge(&combo, &outcome).unwrap();
        assert_eq!(prepared.rows, 4);

        let receipt = agg.persist(prepared).await.unwrap();
        assert_eq!(receipt.rows, 4);

        let rows = agg.store().read_records().await.unwrap();
        let order: Vec<(f64, f64)> = rows.iter().map(|r| (r.concentration[0], r.temperature)).collect();
        assert_eq!(order[0], (0.1, 300.0));
        assert_eq!(order[1], (0.1, 320.0));
        assert!((order[2].0 - 0.3).abs() < 1e-9);
        assert_eq!(receipt.store_len, agg.store().len().await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_batch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(&dir).await;
        let (combo, _) = combos();

        let prepared = agg.merge(&combo, &BatchOutcome::new(combo.clone())).unwrap();
        let receipt = agg.persist(prepared).await.unwrap();
        assert_eq!(receipt, AppendReceipt { rows: 0, store_len: 0 });
    }

    #[tokio::test]
    async fn test_merge_rejects_duplicates_and_foreign_batches() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(&dir).await;
        let (combo, other) = combos();

        let mut outcome = BatchOutcome::new(combo.clone());
        outcome.successes.push(success(0, &[300.0]));
        outcome.successes.push(success(0, &[300.0]));
        assert!(matches!(
            agg.merge(&combo, &outcome),
            Err(AggregateError::DuplicateItem(0))
        ));

        let foreign = BatchOutcome::new(other);
        assert!(matches!(
            agg.merge(&combo, &foreign),
            Err(AggregateError::WrongCombination { .. })
        ));
    }
}
