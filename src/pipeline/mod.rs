//! Generation pipeline.
//!
//! # Architecture
//!
//! - **Config**: run parameters, layered from defaults, YAML, environment and CLI
//! - **Driver**: the control loop that walks the composition space
//! - **Progress**: periodic progress logging for long runs
//! - **Retry**: turns failure log entries back into work
//! - **Status**: read-only summary of a run directory
//!
//! # Pipeline Flow
//!
//! 1. **Resume scan**: validate the checkpoint and drop uncommitted rows
//! 2. **Dispatch**: expand the next combination into work items and run them
//! 3. **Aggregate**: merge the batch and append it to the output store
//! 4. **Checkpoint**: record the combination as finished
//!
//! # Example
//!
//! ```rust,ignore
//! use tern_forge::pipeline::{PipelineConfig, PipelineDriver};
//!
//! let config = PipelineConfig::new()
//!     .with_elements(["AL", "CU", "FE", "NI"])
//!     .with_num_workers(4)
//!     .with_data_dir("./run-01");
//!
//! let mut driver = PipelineDriver::new(&config).await?;
//! driver.shutdown_handle().listen_for_ctrl_c();
//! let summary = driver.run().await?;
//! println!("{} combinations, {} rows", summary.processed, summary.rows_written);
//! ```

pub mod config;
pub mod driver;
pub mod progress;
pub mod retry;
pub mod status;

pub use config::{ConfigError, PipelineConfig, SolverSelection};
pub use driver::{DriverState, PipelineDriver, PipelineError, RunSummary, ShutdownHandle};
pub use progress::{ProgressCounters, ProgressMonitor, ProgressSnapshot};
pub use retry::{plan_retry, RetryFilter, RetryTarget};
pub use status::RunStatus;
