//! External solver process adapter.
//!
//! Each call spawns the configured program, writes one JSON request to its
//! stdin and reads a JSON array of [`EquilibriumSample`]s from its stdout.
//! A fresh process per work item keeps workers free of shared state. When
//! the request carries a deadline the process is killed once it passes.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

use super::{EquilibriumSample, EquilibriumSolver, SolveRequest, SolverContext, SolverError};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Request document sent to the external solver.
#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    elements: [&'a str; 3],
    phases: &'a [String],
    conditions: CommandConditions,
}

#[derive(Debug, Serialize)]
struct CommandConditions {
    temperatures: Vec<f64>,
    pressure: f64,
    system_size: f64,
    /// Mole fraction per solute symbol.
    composition: BTreeMap<String, f64>,
}

/// Runs `program args...` once per composition.
#[derive(Debug, Clone)]
pub struct CommandSolver {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandSolver {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    fn request_body(
        context: &SolverContext,
        request: &SolveRequest<'_>,
    ) -> Result<Vec<u8>, SolverError> {
        let [primary, solute_a, solute_b] = request.elements;
        let mut composition = BTreeMap::new();
        composition.insert(solute_a.symbol().to_string(), request.composition.w_a);
        composition.insert(solute_b.symbol().to_string(), request.composition.w_b);

        let body = CommandRequest {
            elements: [primary.symbol(), solute_a.symbol(), solute_b.symbol()],
            phases: &context.database.phases,
            conditions: CommandConditions {
                temperatures: context.sweep.temperatures(),
                pressure: context.pressure,
                system_size: context.system_size,
                composition,
            },
        };
        Ok(serde_json::to_vec(&body)?)
    }

    fn kill(&self, child: &mut Child) {
        if let Err(e) = child.kill() {
            warn!(program = %self.program.display(), pid = child.id(), error = %e, "Could not kill solver process");
        }
        if let Err(e) = child.wait() {
            warn!(program = %self.program.display(), pid = child.id(), error = %e, "Could not reap solver process");
        }
    }
}

impl EquilibriumSolver for CommandSolver {
    fn name(&self) -> &str {
        "command"
    }

    fn solve(
        &self,
        context: &SolverContext,
        request: &SolveRequest<'_>,
    ) -> Result<Vec<EquilibriumSample>, SolverError> {
        let body = Self::request_body(context, request)?;

        let started = Instant::now();
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                SolverError::Process(format!("failed to start {}: {}", self.program.display(), e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&body) {
                self.kill(&mut child);
                return Err(SolverError::Process(format!("failed to write request: {}", e)));
            }
        }

        // Both pipes drain on their own threads so a chatty solver cannot
        // block on a full pipe while we poll for its exit.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match request.deadline {
            None => child
                .wait()
                .map_err(|e| SolverError::Process(format!("failed to wait for solver: {}", e)))?,
            Some(deadline) => loop {
                let polled = child
                    .try_wait()
                    .map_err(|e| SolverError::Process(format!("failed to poll solver: {}", e)))?;
                if let Some(status) = polled {
                    break status;
                }
                let now = Instant::now();
                if now >= deadline {
                    self.kill(&mut child);
                    // Reader threads are left to finish when the pipes close.
                    return Err(SolverError::TimedOut(started.elapsed()));
                }
                std::thread::sleep(POLL_INTERVAL.min(deadline - now));
            },
        };

        let stdout = collect(stdout)?;
        let stderr = collect(stderr)?;

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(SolverError::NonZeroExit {
                code: status.code().unwrap_or(-1),
                stderr: stderr.trim().chars().take(500).collect(),
            });
        }

        serde_json::from_slice(&stdout)
            .map_err(|e| SolverError::InvalidOutput(format!("expected sample array: {}", e)))
    }
}

type Drain = Option<JoinHandle<io::Result<Vec<u8>>>>;

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Drain {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf)?;
            Ok(buf)
        })
    })
}

fn collect(drain: Drain) -> Result<Vec<u8>, SolverError> {
    match drain {
        None => Ok(Vec::new()),
        Some(handle) => handle
            .join()
            .map_err(|_| SolverError::Process("pipe reader panicked".to_string()))?
            .map_err(|e| SolverError::Process(format!("failed to read solver output: {}", e))),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::solver::TemperatureSweep;
    use crate::space::{CompositionSpace, ConcentrationPoint, ElementCatalogue, GridSpec};

    fn elements() -> [crate::space::Element; 3] {
        let space = CompositionSpace::new(
            ElementCatalogue::new(["AL", "CU", "FE"]).unwrap(),
            &GridSpec::default(),
        )
        .unwrap();
        space.combinations().next().unwrap().elements().clone()
    }

    fn sh(script: &str) -> CommandSolver {
        CommandSolver::new("sh").with_args(vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_request_body_shape() {
        let elements = elements();
        let context = SolverContext {
            sweep: TemperatureSweep {
                start: 300.0,
                end: 340.0,
                step: 20.0,
            },
            ..SolverContext::default()
        };
        let request = SolveRequest::new(&elements, ConcentrationPoint { w_a: 0.2, w_b: 0.1 });
        let body = CommandSolver::request_body(&context, &request).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(value["elements"], serde_json::json!(["AL", "CU", "FE"]));
        assert_eq!(value["conditions"]["temperatures"], serde_json::json!([300.0, 320.0]));
        assert_eq!(value["conditions"]["composition"]["CU"], 0.2);
        assert_eq!(value["conditions"]["composition"]["FE"], 0.1);
        assert_eq!(value["conditions"]["pressure"], 101325.0);
    }

    #[test]
    fn test_parses_solver_stdout() {
        let solver = sh(
            r#"cat > /dev/null; echo '[{"temperature":300.0,"gibbs_energy":-1.5,"phase_fractions":[1.0],"phase_labels":["LIQUID"]}]'"#,
        );
        let elements = elements();
        let request = SolveRequest::new(&elements, ConcentrationPoint { w_a: 0.1, w_b: 0.1 });
        let samples = solver.solve(&SolverContext::default(), &request).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].gibbs_energy, -1.5);
    }

    #[test]
    fn test_non_zero_exit_is_reported() {
        let solver = sh("cat > /dev/null; echo 'no convergence' >&2; exit 3");
        let elements = elements();
        let request = SolveRequest::new(&elements, ConcentrationPoint { w_a: 0.1, w_b: 0.1 });
        match solver.solve(&SolverContext::default(), &request) {
            Err(SolverError::NonZeroExit { code, stderr }) => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "no convergence");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_garbage_output_is_invalid() {
        let solver = sh("cat > /dev/null; echo not-json");
        let elements = elements();
        let request = SolveRequest::new(&elements, ConcentrationPoint { w_a: 0.1, w_b: 0.1 });
        assert!(matches!(
            solver.solve(&SolverContext::default(), &request),
            Err(SolverError::InvalidOutput(_))
        ));
    }

    #[test]
    fn test_missing_program() {
        let solver = CommandSolver::new("/nonexistent/solver-binary");
        let elements = elements();
        let request = SolveRequest::new(&elements, ConcentrationPoint { w_a: 0.1, w_b: 0.1 });
        assert!(matches!(
            solver.solve(&SolverContext::default(), &request),
            Err(SolverError::Process(_))
        ));
    }

    #[test]
    fn test_deadline_kills_hung_solver() {
        let solver = sh("cat > /dev/null; exec sleep 5");
        let elements = elements();
        let request = SolveRequest::new(&elements, ConcentrationPoint { w_a: 0.1, w_b: 0.1 })
            .with_deadline(Some(Instant::now() + Duration::from_millis(100)));

        let started = Instant::now();
        let result = solver.solve(&SolverContext::default(), &request);
        assert!(matches!(result, Err(SolverError::TimedOut(_))), "{:?}", result);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_deadline_leaves_fast_solver_alone() {
        let solver = sh(
            r#"cat > /dev/null; echo '[{"temperature":300.0,"gibbs_energy":-2.0,"phase_fractions":[1.0],"phase_labels":["FCC_A1"]}]'"#,
        );
        let elements = elements();
        let request = SolveRequest::new(&elements, ConcentrationPoint { w_a: 0.1, w_b: 0.1 })
            .with_deadline(Some(Instant::now() + Duration::from_secs(10)));
        let samples = solver.solve(&SolverContext::default(), &request).unwrap();
        assert_eq!(samples[0].phase_labels, vec!["FCC_A1".to_string()]);
    }
}
