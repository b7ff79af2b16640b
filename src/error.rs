//! Error types shared across tern-forge subsystems.
//!
//! Subsystem-local errors live next to their module (`SpaceError`,
//! `SolverError`, `PoolError`, `ConfigError`, `PipelineError`); this file
//! holds the persistence and export errors used by several modules:
//! - Output store and failure log I/O
//! - Result aggregation
//! - Checkpoint reading, writing and validation
//! - Dataset export and label encoding

use thiserror::Error;

/// Errors from the append-only files (output store, failure log).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt record at {path}:{line}: {message}")]
    Corrupt {
        path: String,
        line: usize,
        message: String,
    },
}

/// Errors raised while merging one combination's results, before any I/O.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("Work item {0} reported twice")]
    DuplicateItem(usize),

    #[error("Batch belongs to {found}, expected {expected}")]
    WrongCombination { expected: String, found: String },

    #[error("Failed to encode rows: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors that can occur during checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(
        "Checkpoint was written for a different element catalogue \
         (checkpoint {found}, current {expected}); clear it or restore the catalogue"
    )]
    IncompatibleCatalogue { expected: String, found: String },

    #[error("Checkpoint does not match the current enumeration: {0}")]
    Mismatch(String),

    #[error("Invalid legacy marker: {0}")]
    InvalidLegacyMarker(String),
}

/// Errors that can occur during export operations.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("No rows to export")]
    NoRows,

    #[error("Unknown phase label '{0}'")]
    UnknownLabel(String),

    #[error("Row has {0} phases, at most 3 can be encoded")]
    TooManyPhases(usize),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
