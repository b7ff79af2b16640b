//! tern-forge: checkpointed generator of ternary equilibrium datasets.
//!
//! This library enumerates element triples over a concentration grid, runs
//! an equilibrium solver for every composition on a bounded worker pool and
//! appends the results to a durable, resumable store.

// Core modules
pub mod cli;
pub mod error;
pub mod export;
pub mod labels;
pub mod pipeline;
pub mod scheduler;
pub mod solver;
pub mod space;
pub mod storage;

// Re-export commonly used error types
pub use error::{AggregateError, CheckpointError, ExportError, StoreError};
pub use pipeline::{ConfigError, PipelineConfig, PipelineDriver, PipelineError, RunSummary};
