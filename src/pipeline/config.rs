//! Pipeline configuration for the generation driver.
//!
//! This module provides the run parameters of a generation run: the element
//! catalogue, the concentration grid, the temperature sweep and conditions,
//! worker settings, solver selection and the paths of the durable files.
//!
//! Values are layered: defaults, then an optional YAML file, then
//! `TERNFORGE_*` environment variables, then CLI flags.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::{default_worker_count, WorkerPoolConfig};
use crate::solver::{
    CommandSolver, EquilibriumSolver, IdealMixingSolver, PhaseDatabase, SolverContext,
    TemperatureSweep,
};
use crate::space::{CompositionSpace, ElementCatalogue, GridSpec, DEFAULT_ELEMENTS};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The YAML configuration file could not be parsed.
    #[error("Invalid configuration file {path}: {message}")]
    InvalidFile { path: String, message: String },

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which equilibrium solver the workers call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SolverSelection {
    /// Built-in ideal-solution model.
    #[default]
    Ideal,
    /// External program speaking JSON over stdin/stdout.
    Command {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Configuration for one generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // Composition space
    /// Ordered element catalogue.
    pub elements: Vec<String>,
    /// Concentration grid parameters.
    pub grid: GridSpec,

    // Conditions
    /// Temperature sweep in Kelvin.
    pub sweep: TemperatureSweep,
    /// Pressure in Pa.
    pub pressure: f64,
    /// Total amount of substance in moles.
    pub system_size: f64,
    /// YAML phase list; the built-in list is used when unset.
    pub phase_database: Option<PathBuf>,
    pub solver: SolverSelection,

    // Execution settings
    /// Number of concurrent solver calls.
    pub num_workers: usize,
    /// Per-item solver timeout in seconds; no timeout when unset.
    pub item_timeout_secs: Option<u64>,
    /// Maximum number of combinations processed by one run.
    pub limit: Option<u64>,
    /// Interval between progress log lines, in seconds.
    pub progress_interval_secs: u64,

    // Storage settings
    /// JSON Lines output store.
    pub output_path: PathBuf,
    /// Checkpoint file.
    pub checkpoint_path: PathBuf,
    /// JSON Lines failure log.
    pub failure_log_path: PathBuf,
    /// Plain-text last-combination marker to import when no checkpoint exists.
    pub legacy_marker: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            elements: DEFAULT_ELEMENTS.iter().map(|s| s.to_string()).collect(),
            grid: GridSpec::default(),

            sweep: TemperatureSweep::default(),
            pressure: 101_325.0,
            system_size: 1.0,
            phase_database: None,
            solver: SolverSelection::Ideal,

            num_workers: default_worker_count(),
            item_timeout_secs: None,
            limit: None,
            progress_interval_secs: 60,

            output_path: PathBuf::from("./tern-data/results.jsonl"),
            checkpoint_path: PathBuf::from("./tern-data/checkpoint.json"),
            failure_log_path: PathBuf::from("./tern-data/failures.jsonl"),
            legacy_marker: None,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a YAML configuration file. Missing keys keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::InvalidFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Creates configuration from defaults and environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TERNFORGE_ELEMENTS`: Comma-separated element catalogue
    /// - `TERNFORGE_W_START`, `TERNFORGE_W_END`, `TERNFORGE_W_STEP`: Grid range
    /// - `TERNFORGE_PRECISION`: Grid rounding in decimals (default: 1)
    /// - `TERNFORGE_T_START`, `TERNFORGE_T_END`, `TERNFORGE_T_STEP`: Sweep in K
    /// - `TERNFORGE_PRESSURE`: Pressure in Pa (default: 101325)
    /// - `TERNFORGE_SYSTEM_SIZE`: Moles (default: 1)
    /// - `TERNFORGE_PHASE_DATABASE`: YAML phase list
    /// - `TERNFORGE_SOLVER_COMMAND`: External solver program
    /// - `TERNFORGE_WORKERS`: Concurrent solver calls
    /// - `TERNFORGE_ITEM_TIMEOUT_SECS`: Per-item timeout
    /// - `TERNFORGE_LIMIT`: Maximum combinations per run
    /// - `TERNFORGE_OUTPUT`, `TERNFORGE_CHECKPOINT`, `TERNFORGE_FAILURE_LOG`: Paths
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("TERNFORGE_ELEMENTS") {
            self.elements = parse_list(&val);
        }

        // Grid settings
        if let Ok(val) = std::env::var("TERNFORGE_W_START") {
            self.grid.start = parse_env_value(&val, "TERNFORGE_W_START")?;
        }
        if let Ok(val) = std::env::var("TERNFORGE_W_END") {
            self.grid.end = parse_env_value(&val, "TERNFORGE_W_END")?;
        }
        if let Ok(val) = std::env::var("TERNFORGE_W_STEP") {
            self.grid.step = parse_env_value(&val, "TERNFORGE_W_STEP")?;
        }
        if let Ok(val) = std::env::var("TERNFORGE_PRECISION") {
            self.grid.precision = parse_env_value(&val, "TERNFORGE_PRECISION")?;
        }

        // Conditions
        if let Ok(val) = std::env::var("TERNFORGE_T_START") {
            self.sweep.start = parse_env_value(&val, "TERNFORGE_T_START")?;
        }
        if let Ok(val) = std::env::var("TERNFORGE_T_END") {
            self.sweep.end = parse_env_value(&val, "TERNFORGE_T_END")?;
        }
        if let Ok(val) = std::env::var("TERNFORGE_T_STEP") {
            self.sweep.step = parse_env_value(&val, "TERNFORGE_T_STEP")?;
        }
        if let Ok(val) = std::env::var("TERNFORGE_PRESSURE") {
            self.pressure = parse_env_value(&val, "TERNFORGE_PRESSURE")?;
        }
        if let Ok(val) = std::env::var("TERNFORGE_SYSTEM_SIZE") {
            self.system_size = parse_env_value(&val, "TERNFORGE_SYSTEM_SIZE")?;
        }
        if let Ok(val) = std::env::var("TERNFORGE_PHASE_DATABASE") {
            self.phase_database = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("TERNFORGE_SOLVER_COMMAND") {
            self.solver = SolverSelection::Command {
                program: PathBuf::from(val),
                args: Vec::new(),
            };
        }

        // Execution settings
        if let Ok(val) = std::env::var("TERNFORGE_WORKERS") {
            self.num_workers = parse_env_value(&val, "TERNFORGE_WORKERS")?;
        }
        if let Ok(val) = std::env::var("TERNFORGE_ITEM_TIMEOUT_SECS") {
            self.item_timeout_secs = Some(parse_env_value(&val, "TERNFORGE_ITEM_TIMEOUT_SECS")?);
        }
        if let Ok(val) = std::env::var("TERNFORGE_LIMIT") {
            self.limit = Some(parse_env_value(&val, "TERNFORGE_LIMIT")?);
        }

        // Storage settings
        if let Ok(val) = std::env::var("TERNFORGE_OUTPUT") {
            self.output_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("TERNFORGE_CHECKPOINT") {
            self.checkpoint_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("TERNFORGE_FAILURE_LOG") {
            self.failure_log_path = PathBuf::from(val);
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.elements.len() < 3 {
            return Err(ConfigError::ValidationFailed(format!(
                "element catalogue needs at least 3 elements, got {}",
                self.elements.len()
            )));
        }

        self.grid
            .validate()
            .map_err(|e| ConfigError::ValidationFailed(e.to_string()))?;
        self.sweep.validate().map_err(ConfigError::ValidationFailed)?;

        if !(self.pressure.is_finite() && self.pressure > 0.0) {
            return Err(ConfigError::ValidationFailed(
                "pressure must be greater than 0".to_string(),
            ));
        }

        if !(self.system_size.is_finite() && self.system_size > 0.0) {
            return Err(ConfigError::ValidationFailed(
                "system_size must be greater than 0".to_string(),
            ));
        }

        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if self.item_timeout_secs == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "item_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.progress_interval_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "progress_interval_secs must be greater than 0".to_string(),
            ));
        }

        if let SolverSelection::Command { program, .. } = &self.solver {
            if program.as_os_str().is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "solver program cannot be empty".to_string(),
                ));
            }
        }

        let paths = [&self.output_path, &self.checkpoint_path, &self.failure_log_path];
        if paths.iter().any(|p| p.as_os_str().is_empty()) {
            return Err(ConfigError::ValidationFailed(
                "output, checkpoint and failure log paths cannot be empty".to_string(),
            ));
        }
        if self.output_path == self.checkpoint_path
            || self.output_path == self.failure_log_path
            || self.checkpoint_path == self.failure_log_path
        {
            return Err(ConfigError::ValidationFailed(
                "output, checkpoint and failure log must be distinct files".to_string(),
            ));
        }

        Ok(())
    }

    /// Per-item timeout, if any.
    pub fn item_timeout(&self) -> Option<Duration> {
        self.item_timeout_secs.map(Duration::from_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }

    /// Builds the composition space described by this configuration.
    pub fn composition_space(&self) -> Result<CompositionSpace, ConfigError> {
        let catalogue = ElementCatalogue::new(self.elements.iter().map(String::as_str))
            .map_err(|e| ConfigError::ValidationFailed(e.to_string()))?;
        CompositionSpace::new(catalogue, &self.grid)
            .map_err(|e| ConfigError::ValidationFailed(e.to_string()))
    }

    /// Loads the phase database and assembles the shared solver context.
    pub fn solver_context(&self) -> Result<SolverContext, ConfigError> {
        let database = match &self.phase_database {
            Some(path) => PhaseDatabase::from_yaml_file(path).map_err(|e| {
                ConfigError::InvalidFile {
                    path: path.display().to_string(),
                    message: e.to_string(),
                }
            })?,
            None => PhaseDatabase::default(),
        };
        Ok(SolverContext {
            database,
            sweep: self.sweep.clone(),
            pressure: self.pressure,
            system_size: self.system_size,
        })
    }

    /// Instantiates the configured solver.
    pub fn build_solver(&self) -> Arc<dyn EquilibriumSolver> {
        match &self.solver {
            SolverSelection::Ideal => Arc::new(IdealMixingSolver::new()),
            SolverSelection::Command { program, args } => {
                Arc::new(CommandSolver::new(program.clone()).with_args(args.clone()))
            }
        }
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        let config = WorkerPoolConfig::new(self.num_workers);
        match self.item_timeout() {
            Some(timeout) => config.with_item_timeout(timeout),
            None => config,
        }
    }

    /// Builder method to set the element catalogue.
    pub fn with_elements<I, S>(mut self, elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.elements = elements.into_iter().map(Into::into).collect();
        self
    }

    /// Builder method to set the concentration grid.
    pub fn with_grid(mut self, grid: GridSpec) -> Self {
        self.grid = grid;
        self
    }

    /// Builder method to set the temperature sweep.
    pub fn with_sweep(mut self, sweep: TemperatureSweep) -> Self {
        self.sweep = sweep;
        self
    }

    /// Builder method to set the pressure.
    pub fn with_pressure(mut self, pressure: f64) -> Self {
        self.pressure = pressure;
        self
    }

    /// Builder method to set the phase database file.
    pub fn with_phase_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.phase_database = Some(path.into());
        self
    }

    /// Builder method to set the solver.
    pub fn with_solver(mut self, solver: SolverSelection) -> Self {
        self.solver = solver;
        self
    }

    /// Builder method to set the number of workers.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Builder method to set the per-item timeout.
    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    /// Builder method to bound the number of combinations per run.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Builder method to place all three run files in one directory.
    pub fn with_data_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        self.output_path = dir.join("results.jsonl");
        self.checkpoint_path = dir.join("checkpoint.json");
        self.failure_log_path = dir.join("failures.jsonl");
        self
    }

    /// Builder method to set the output store path.
    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = path.into();
        self
    }

    /// Builder method to set the checkpoint path.
    pub fn with_checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = path.into();
        self
    }

    /// Builder method to set the failure log path.
    pub fn with_failure_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.failure_log_path = path.into();
        self
    }

    /// Builder method to set a legacy marker to import.
    pub fn with_legacy_marker(mut self, path: impl Into<PathBuf>) -> Self {
        self.legacy_marker = Some(path.into());
        self
    }
}

/// Parses an environment variable value to the specified type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Splits a comma or whitespace separated list.
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
