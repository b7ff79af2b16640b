//! Two-dimensional concentration grid shared by every combination.

use serde::{Deserialize, Serialize};

use super::SpaceError;

const SUM_TOLERANCE: f64 = 1e-9;
const MAX_PRECISION: u32 = 12;

/// Mole fractions of the two solutes, `(w_a, w_b)`.
///
/// Always `w_a > 0`, `w_b > 0` and `w_a + w_b < 1`; the primary element
/// makes up the balance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConcentrationPoint {
    pub w_a: f64,
    pub w_b: f64,
}

impl ConcentrationPoint {
    /// Fraction left for the primary element.
    pub fn balance(&self) -> f64 {
        1.0 - self.w_a - self.w_b
    }

    /// Same grid point, ignoring float noise from serialisation.
    pub fn approx_eq(&self, other: &ConcentrationPoint) -> bool {
        (self.w_a - other.w_a).abs() < SUM_TOLERANCE && (self.w_b - other.w_b).abs() < SUM_TOLERANCE
    }
}

/// Step grid parameters: values `start + n * step` below `end`, rounded to
/// `precision` decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub start: f64,
    pub end: f64,
    pub step: f64,
    pub precision: u32,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: 1.0,
            step: 0.1,
            precision: 1,
        }
    }
}

impl GridSpec {
    pub fn validate(&self) -> Result<(), SpaceError> {
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(SpaceError::InvalidGrid(format!(
                "step must be positive, got {}",
                self.step
            )));
        }
        if !(self.start.is_finite() && self.end.is_finite()) || self.start < 0.0 || self.end > 1.0 {
            return Err(SpaceError::InvalidGrid(format!(
                "range [{}, {}) must lie within [0, 1]",
                self.start, self.end
            )));
        }
        if self.start >= self.end {
            return Err(SpaceError::InvalidGrid(format!(
                "start ({}) must be below end ({})",
                self.start, self.end
            )));
        }
        if self.precision > MAX_PRECISION {
            return Err(SpaceError::InvalidGrid(format!(
                "precision must be at most {MAX_PRECISION} decimals"
            )));
        }
        let scale = 10f64.powi(self.precision as i32);
        if self.step * scale < 1.0 - SUM_TOLERANCE {
            return Err(SpaceError::InvalidGrid(format!(
                "step {} is finer than the rounding precision of {} decimals",
                self.step, self.precision
            )));
        }
        Ok(())
    }

    /// The one-dimensional axis, rounded.
    pub fn axis(&self) -> Vec<f64> {
        let scale = 10f64.powi(self.precision as i32);
        let mut values = Vec::new();
        let mut n = 0u64;
        loop {
            let raw = self.start + n as f64 * self.step;
            if raw >= self.end - SUM_TOLERANCE {
                break;
            }
            values.push((raw * scale).round() / scale);
            n += 1;
        }
        values
    }
}

/// Filtered Cartesian product of the axis with itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcentrationGrid {
    points: Vec<ConcentrationPoint>,
}

impl ConcentrationGrid {
    pub fn build(spec: &GridSpec) -> Result<Self, SpaceError> {
        spec.validate()?;
        let axis = spec.axis();

        let mut points = Vec::new();
        for &w_a in &axis {
            for &w_b in &axis {
                if w_a > 0.0 && w_b > 0.0 && w_a + w_b < 1.0 - SUM_TOLERANCE {
                    points.push(ConcentrationPoint { w_a, w_b });
                }
            }
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[ConcentrationPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConcentrationPoint> {
        self.points.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(start: f64, end: f64, step: f64, precision: u32) -> GridSpec {
        GridSpec {
            start,
            end,
            step,
            precision,
        }
    }

    #[test]
    fn test_default_grid_has_36_points() {
        // Pairs of tenths (1..=9) with a + b <= 9 tenths: 8+7+...+1 = 36.
        let grid = ConcentrationGrid::build(&GridSpec::default()).unwrap();
        assert_eq!(grid.len(), 36);
        assert_eq!(grid.points()[0], ConcentrationPoint { w_a: 0.1, w_b: 0.1 });
        assert_eq!(grid.points()[35], ConcentrationPoint { w_a: 0.8, w_b: 0.1 });
    }

    #[test]
    fn test_points_satisfy_invariants() {
        for (step, precision) in [(0.1, 1), (0.05, 2), (0.2, 1), (0.25, 2), (0.125, 3)] {
            let grid = ConcentrationGrid::build(&spec(0.0, 1.0, step, precision)).unwrap();
            assert!(!grid.is_empty());
            for p in grid.iter() {
                assert!(p.w_a > 0.0);
                assert!(p.w_b > 0.0);
                assert!(p.w_a + p.w_b < 1.0);
                assert!(p.balance() > 0.0);

                let ticks_a = p.w_a / step;
                let ticks_b = p.w_b / step;
                assert!((ticks_a - ticks_a.round()).abs() < 1e-6, "{p:?} off grid");
                assert!((ticks_b - ticks_b.round()).abs() < 1e-6, "{p:?} off grid");
            }
        }
    }

    #[test]
    fn test_half_step_grid_is_empty() {
        // Axis is {0.0, 0.5}; 0.0 is excluded and (0.5, 0.5) sums to 1.
        let spec = spec(0.0, 1.0, 0.5, 1);
        assert_eq!(spec.axis(), vec![0.0, 0.5]);
        let grid = ConcentrationGrid::build(&spec).unwrap();
        assert!(grid.is_empty());
    }

    #[test]
    fn test_third_step_grid() {
        let grid = ConcentrationGrid::build(&spec(0.0, 1.0, 0.25, 2)).unwrap();
        let expected = vec![
            ConcentrationPoint { w_a: 0.25, w_b: 0.25 },
            ConcentrationPoint { w_a: 0.25, w_b: 0.5 },
            ConcentrationPoint { w_a: 0.5, w_b: 0.25 },
        ];
        assert_eq!(grid.points(), expected.as_slice());
    }

    #[test]
    fn test_grid_is_identical_across_builds() {
        let a = ConcentrationGrid::build(&GridSpec::default()).unwrap();
        let b = ConcentrationGrid::build(&GridSpec::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_specs() {
        assert!(spec(0.0, 1.0, 0.0, 1).validate().is_err());
        assert!(spec(0.5, 0.5, 0.1, 1).validate().is_err());
        assert!(spec(-0.1, 1.0, 0.1, 1).validate().is_err());
        assert!(spec(0.0, 1.5, 0.1, 1).validate().is_err());
        assert!(spec(0.0, 1.0, 0.01, 1).validate().is_err());
        assert!(spec(0.0, 1.0, 0.1, 20).validate().is_err());
    }
}
