//! Work dispatch: expanding combinations into work items and running them
//! on a bounded pool of solver workers.
//!
//! - **WorkItemBuilder**: combination x concentration grid -> work items
//! - **WorkerPool**: runs one combination's items concurrently
//! - **BatchOutcome**: per-item successes and failures of one batch
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │    Driver    │
//!                      │ (one combo)  │
//!                      └──────┬───────┘
//!                             │ Vec<WorkItem>
//!                      ┌──────▼───────┐
//!                      │  Semaphore   │
//!                      │ (N permits)  │
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Solver 1│         │ Solver 2│         │ Solver N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! The driver waits for the whole batch before moving on; there is never
//! more than one combination in flight.

pub mod work_item;
pub mod worker_pool;

pub use work_item::{
    BatchOutcome, ItemFailure, ItemOutcome, ItemStatus, ItemSuccess, WorkItem, WorkItemBuilder,
};
pub use worker_pool::{default_worker_count, PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
