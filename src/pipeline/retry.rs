//! Turning failure log entries back into work.

use std::collections::BTreeMap;

use tracing::warn;
use uuid::Uuid;

use crate::scheduler::WorkItem;
use crate::space::{CompositionSpace, ConcentrationPoint};
use crate::storage::{unresolved, FailureKind, FailureRecord};

/// One combination to run again.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryTarget {
    pub rank: u64,
    /// Points to re-run; `None` re-runs the whole grid.
    pub points: Option<Vec<ConcentrationPoint>>,
}

impl RetryTarget {
    pub fn whole(rank: u64) -> Self {
        Self { rank, points: None }
    }

    /// Keeps only the items this target asks for.
    pub fn select(&self, items: Vec<WorkItem>) -> Vec<WorkItem> {
        match &self.points {
            None => items,
            Some(points) => items
                .into_iter()
                .filter(|item| points.iter().any(|p| p.approx_eq(&item.point)))
                .collect(),
        }
    }
}

/// Which failure records a retry should pick up.
#[derive(Debug, Clone, Default)]
pub struct RetryFilter {
    pub run_id: Option<Uuid>,
    pub kinds: Vec<FailureKind>,
}

impl RetryFilter {
    fn accepts(&self, record: &FailureRecord) -> bool {
        self.run_id.map_or(true, |id| id == record.run_id)
            && (self.kinds.is_empty() || self.kinds.contains(&record.kind))
    }
}

/// Groups outstanding failure records by combination, in rank order.
///
/// A combination-level failure re-runs the whole grid; item failures
/// re-run only their points. Skipped:
///
/// - records a later resolution marker covers
/// - persist failures, whose combination a normal run redoes
/// - ranks past `completed_through`, the checkpoint rank, for the same
///   reason (with no checkpoint nothing is eligible)
/// - records whose elements no longer match the catalogue at that rank
pub fn plan_retry(
    space: &CompositionSpace,
    records: &[FailureRecord],
    filter: &RetryFilter,
    completed_through: Option<u64>,
) -> Vec<RetryTarget> {
    let mut by_rank: BTreeMap<u64, Option<Vec<ConcentrationPoint>>> = BTreeMap::new();

    let outstanding = unresolved(records)
        .into_iter()
        .filter(|r| r.kind != FailureKind::Persist)
        .filter(|r| completed_through.is_some_and(|done| r.rank <= done))
        .filter(|r| filter.accepts(r));

    for record in outstanding {
        match space.combination_at(record.rank) {
            Ok(combination) if combination.symbols() == record.elements => {}
            _ => {
                warn!(
                    rank = record.rank,
                    elements = %record.elements.join("-"),
                    "Failure record does not match the current catalogue, skipping"
                );
                continue;
            }
        }

        let entry = by_rank.entry(record.rank).or_insert_with(|| Some(Vec::new()));
        match (record.point, entry.as_mut()) {
            (Some(point), Some(points)) => {
                if !points.iter().any(|p| p.approx_eq(&point)) {
                    points.push(point);
                }
            }
            (None, _) => *entry = None,
            (Some(_), None) => {}
        }
    }

    by_rank
        .into_iter()
        .map(|(rank, points)| RetryTarget { rank, points })
        .collect()
}
