//! Equilibrium solver seam.
//!
//! The thermodynamic solver is an external collaborator. The pipeline only
//! needs a function from one composition to an ordered temperature series of
//! samples; [`EquilibriumSolver`] is that function. Everything the solver
//! needs beyond the composition lives in an immutable [`SolverContext`] that
//! is built once per run and shared read-only with every worker.
//!
//! Two adapters ship with the crate:
//!
//! - [`IdealMixingSolver`]: analytic ideal-solution reference model, used for
//!   smoke runs and tests.
//! - [`CommandSolver`]: runs an external solver program once per work item,
//!   exchanging JSON over stdin/stdout.

pub mod command;
pub mod ideal;

pub use command::CommandSolver;
pub use ideal::IdealMixingSolver;

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::space::{ConcentrationPoint, Element};

/// Errors returned by a solver for a single composition.
#[derive(Debug, Error)]
pub enum SolverError {
    /// The solver could not reach equilibrium for this composition.
    #[error("Equilibrium calculation failed: {0}")]
    Calculation(String),

    /// The solver process could not be started or talked to.
    #[error("Solver process error: {0}")]
    Process(String),

    /// The solver process exited unsuccessfully.
    #[error("Solver exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    /// The solver produced output the pipeline cannot use.
    #[error("Invalid solver output: {0}")]
    InvalidOutput(String),

    /// The call ran past its deadline.
    #[error("Solver did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("Phase database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Phase candidates loaded once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDatabase {
    #[serde(default = "default_database_name")]
    pub name: String,
    pub phases: Vec<String>,
}

fn default_database_name() -> String {
    "default".to_string()
}

impl Default for PhaseDatabase {
    fn default() -> Self {
        Self {
            name: default_database_name(),
            phases: ["LIQUID", "FCC_A1", "BCC_A2", "HCP_A3"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl PhaseDatabase {
    /// Loads a YAML phase list (`name`, `phases`).
    pub fn from_yaml_file(path: &Path) -> Result<Self, SolverError> {
        let content = std::fs::read_to_string(path)?;
        let mut db: PhaseDatabase = serde_yaml::from_str(&content)
            .map_err(|e| SolverError::Database(format!("{}: {}", path.display(), e)))?;

        db.phases.retain(|p| !p.trim().is_empty());
        db.phases.sort();
        db.phases.dedup();
        if db.phases.is_empty() {
            return Err(SolverError::Database(format!(
                "{} defines no phases",
                path.display()
            )));
        }
        Ok(db)
    }
}

/// Temperature sweep `start, start + step, ...` strictly below `end` (Kelvin).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSweep {
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

impl Default for TemperatureSweep {
    fn default() -> Self {
        Self {
            start: 298.15,
            end: 3000.0,
            step: 20.15,
        }
    }
}

impl TemperatureSweep {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(format!("temperature step must be positive, got {}", self.step));
        }
        if !(self.start.is_finite() && self.start > 0.0) {
            return Err(format!("temperature start must be positive, got {}", self.start));
        }
        if !(self.end.is_finite() && self.end > self.start) {
            return Err(format!(
                "temperature end ({}) must be above start ({})",
                self.end, self.start
            ));
        }
        Ok(())
    }

    /// Sample temperatures, computed by index to avoid accumulated drift.
    pub fn temperatures(&self) -> Vec<f64> {
        let mut temps = Vec::new();
        let mut n = 0u64;
        loop {
            let t = self.start + n as f64 * self.step;
            if t >= self.end {
                break;
            }
            temps.push(t);
            n += 1;
        }
        temps
    }
}

/// Immutable run-wide solver inputs, shared by every worker.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverContext {
    pub database: PhaseDatabase,
    pub sweep: TemperatureSweep,
    /// Pressure in Pa.
    pub pressure: f64,
    /// Total amount of substance in moles.
    pub system_size: f64,
}

impl Default for SolverContext {
    fn default() -> Self {
        Self {
            database: PhaseDatabase::default(),
            sweep: TemperatureSweep::default(),
            pressure: 101_325.0,
            system_size: 1.0,
        }
    }
}

/// One composition to equilibrate.
#[derive(Debug, Clone, Copy)]
pub struct SolveRequest<'a> {
    /// `(primary, solute_a, solute_b)`.
    pub elements: &'a [Element; 3],
    pub composition: ConcentrationPoint,
    /// Latest instant the call may still be running.
    pub deadline: Option<Instant>,
}

impl<'a> SolveRequest<'a> {
    pub fn new(elements: &'a [Element; 3], composition: ConcentrationPoint) -> Self {
        Self {
            elements,
            composition,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Time left before the deadline; `None` without one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }
}

/// Equilibrium state at one temperature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquilibriumSample {
    pub temperature: f64,
    /// Molar Gibbs energy, J/mol.
    pub gibbs_energy: f64,
    pub phase_fractions: Vec<f64>,
    pub phase_labels: Vec<String>,
}

/// Equilibrium calculation for one composition over the run's sweep.
///
/// Implementations are called concurrently from several workers and must not
/// rely on shared mutable state.
///
/// A call occupies its worker until it returns, so implementations must
/// honour [`SolveRequest::deadline`]: [`CommandSolver`] kills its child
/// process, and in-process solvers cannot be pre-empted and should check
/// [`SolveRequest::is_expired`] between iterations and return
/// [`SolverError::TimedOut`].
pub trait EquilibriumSolver: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Returns one sample per sweep temperature, ascending.
    fn solve(
        &self,
        context: &SolverContext,
        request: &SolveRequest<'_>,
    ) -> Result<Vec<EquilibriumSample>, SolverError>;
}

/// Rejects output that is not ordered by ascending temperature.
pub fn check_samples(samples: &[EquilibriumSample]) -> Result<(), SolverError> {
    for pair in samples.windows(2) {
        if !(pair[0].temperature < pair[1].temperature) {
            return Err(SolverError::InvalidOutput(format!(
                "temperatures not ascending: {} then {}",
                pair[0].temperature, pair[1].temperature
            )));
        }
    }
    for sample in samples {
        if sample.phase_fractions.len() != sample.phase_labels.len() {
            return Err(SolverError::InvalidOutput(format!(
                "{} phase fractions but {} phase labels at T={}",
                sample.phase_fractions.len(),
                sample.phase_labels.len(),
                sample.temperature
            )));
        }
    }
    Ok(())
}
