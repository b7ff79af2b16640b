//! Ideal-solution reference model.
//!
//! Molar Gibbs energy of mixing `G = R T sum(x_i ln x_i)` for a single
//! solution phase with pure-element reference states at zero. It has no
//! physical ambition; it gives the pipeline a deterministic, dependency-free
//! solver for smoke runs.

use super::{EquilibriumSample, EquilibriumSolver, SolveRequest, SolverContext, SolverError};

const GAS_CONSTANT: f64 = 8.314_462_618;

/// Single-phase ideal mixing solver.
#[derive(Debug, Clone)]
pub struct IdealMixingSolver {
    phase: Option<String>,
}

impl IdealMixingSolver {
    /// Reports the first database phase as the stable phase.
    pub fn new() -> Self {
        Self { phase: None }
    }

    /// Reports `phase` as the stable phase.
    pub fn with_phase(phase: impl Into<String>) -> Self {
        Self {
            phase: Some(phase.into()),
        }
    }
}

impl Default for IdealMixingSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl EquilibriumSolver for IdealMixingSolver {
    fn name(&self) -> &str {
        "ideal"
    }

    fn solve(
        &self,
        context: &SolverContext,
        request: &SolveRequest<'_>,
    ) -> Result<Vec<EquilibriumSample>, SolverError> {
        let composition = request.composition;
        let fractions = [composition.balance(), composition.w_a, composition.w_b];
        if fractions.iter().any(|x| !(*x > 0.0 && *x < 1.0)) {
            return Err(SolverError::Calculation(format!(
                "composition {:?} outside the open simplex",
                fractions
            )));
        }

        let phase = match &self.phase {
            Some(phase) => phase.clone(),
            None => context
                .database
                .phases
                .first()
                .cloned()
                .ok_or_else(|| SolverError::Database("no phases available".to_string()))?,
        };

        let entropy_term: f64 = fractions.iter().map(|x| x * x.ln()).sum();
        let samples = context
            .sweep
            .temperatures()
            .into_iter()
            .map(|t| EquilibriumSample {
                temperature: t,
                gibbs_energy: GAS_CONSTANT * t * entropy_term,
                phase_fractions: vec![1.0],
                phase_labels: vec![phase.clone()],
            })
            .collect();

        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::TemperatureSweep;
    use crate::space::{ConcentrationPoint, ElementCatalogue, CompositionSpace, GridSpec};

    fn request_elements() -> [crate::space::Element; 3] {
        let space = CompositionSpace::new(
            ElementCatalogue::new(["AL", "CU", "FE"]).unwrap(),
            &GridSpec::default(),
        )
        .unwrap();
        space.combinations().next().unwrap().elements().clone()
    }

    #[test]
    fn test_ideal_mixing_energy_is_negative_and_scales_with_t() {
        let context = SolverContext {
            sweep: TemperatureSweep {
                start: 300.0,
                end: 700.0,
                step: 200.0,
            },
            ..SolverContext::default()
        };
        let elements = request_elements();
        let request = SolveRequest::new(&elements, ConcentrationPoint { w_a: 0.2, w_b: 0.3 });

        let samples = IdealMixingSolver::new().solve(&context, &request).unwrap();
        assert_eq!(samples.len(), 2);
        assert!(samples[0].gibbs_energy < 0.0);
        let ratio = samples[1].gibbs_energy / samples[0].gibbs_energy;
        assert!((ratio - 500.0 / 300.0).abs() < 1e-9);
        assert_eq!(samples[0].phase_labels, vec!["LIQUID"]);
        assert_eq!(samples[0].phase_fractions, vec![1.0]);
    }

    #[test]
    fn test_configured_phase() {
        let elements = request_elements();
        let request = SolveRequest::new(&elements, ConcentrationPoint { w_a: 0.1, w_b: 0.1 });
        let samples = IdealMixingSolver::with_phase("FCC_A1")
            .solve(&SolverContext::default(), &request)
            .unwrap();
        assert!(samples.iter().all(|s| s.phase_labels == vec!["FCC_A1"]));
    }

    #[test]
    fn test_rejects_degenerate_composition() {
        let elements = request_elements();
        let request = SolveRequest::new(&elements, ConcentrationPoint { w_a: 0.5, w_b: 0.5 });
        assert!(matches!(
            IdealMixingSolver::new().solve(&SolverContext::default(), &request),
            Err(SolverError::Calculation(_))
        ));
    }
}
