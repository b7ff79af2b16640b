//! Durable state of a run.
//!
//! - **OutputStore**: append-only JSON Lines file of result rows
//! - **ResultAggregator**: turns one combination's batch into a single append
//! - **CheckpointManager**: last finished combination, replaced atomically
//! - **ErrorRecorder**: append-only failure log
//!
//! Each file has exactly one writer, the pipeline driver's control task.

pub mod aggregator;
pub mod checkpoint;
pub mod failure_log;
pub mod output_store;

pub use aggregator::{AppendReceipt, PreparedAppend, ResultAggregator};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use failure_log::{unresolved, ErrorRecorder, FailureKind, FailureRecord};
pub use output_store::{OutputStore, ResultRecord};
