//! Work items and their per-item outcomes.
//!
//! - `WorkItem`: one (combination, concentration point) solver call
//! - `WorkItemBuilder`: expands a combination over the concentration grid
//! - `ItemSuccess` / `ItemFailure`: what a worker hands back
//! - `ItemStatus`: how a failed item ended

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::solver::EquilibriumSample;
use crate::space::{Combination, ConcentrationGrid, ConcentrationPoint};

/// The unit of dispatch: one composition to equilibrate.
///
/// Owns everything a worker needs, so it can be moved onto any thread.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// Position of this item within its combination's batch.
    pub index: usize,
    pub combination: Combination,
    pub point: ConcentrationPoint,
}

/// Expands combinations into work items. Pure; no solver state involved.
#[derive(Debug, Clone)]
pub struct WorkItemBuilder<'a> {
    grid: &'a ConcentrationGrid,
}

impl<'a> WorkItemBuilder<'a> {
    pub fn new(grid: &'a ConcentrationGrid) -> Self {
        Self { grid }
    }

    /// One item per grid point, in grid order.
    pub fn build(&self, combination: &Combination) -> Vec<WorkItem> {
        self.grid
            .iter()
            .enumerate()
            .map(|(index, point)| WorkItem {
                index,
                combination: combination.clone(),
                point: *point,
            })
            .collect()
    }
}

/// How a work item ended when it produced no samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// The solver returned an error.
    Failed,
    /// The solver did not answer within the item timeout.
    Timeout,
    /// The solver panicked.
    Panicked,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemStatus::Failed => write!(f, "failed"),
            ItemStatus::Timeout => write!(f, "timeout"),
            ItemStatus::Panicked => write!(f, "panicked"),
        }
    }
}

/// Samples computed for one work item.
#[derive(Debug, Clone)]
pub struct ItemSuccess {
    pub index: usize,
    pub point: ConcentrationPoint,
    pub samples: Vec<EquilibriumSample>,
    pub duration: Duration,
}

/// A work item that produced nothing, with the reason.
#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub index: usize,
    pub point: ConcentrationPoint,
    pub status: ItemStatus,
    pub error: String,
    pub duration: Duration,
}

/// Either outcome of one item.
#[derive(Debug, Clone)]
pub enum ItemOutcome {
    Success(ItemSuccess),
    Failure(ItemFailure),
}

impl ItemOutcome {
    pub fn index(&self) -> usize {
        match self {
            ItemOutcome::Success(s) => s.index,
            ItemOutcome::Failure(f) => f.index,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Success(_))
    }
}

/// Everything the pool returns for one combination's batch.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub combination: Combination,
    pub successes: Vec<ItemSuccess>,
    pub failures: Vec<ItemFailure>,
}

impl BatchOutcome {
    pub fn new(combination: Combination) -> Self {
        Self {
            combination,
            successes: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn push(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Success(s) => self.successes.push(s),
            ItemOutcome::Failure(f) => self.failures.push(f),
        }
    }

    pub fn total_items(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    pub fn sample_count(&self) -> usize {
        self.successes.iter().map(|s| s.samples.len()).sum()
    }
}
