//! Quality indicators for multi-objective fitness.
//!
//! Indicators map an `(n, objectives)` fitness matrix to a single number where
//! lower is better, so a monitor can track them like scalar fitness.

use ndarray::{Array2, ArrayView2, Axis};

use ef_types::{as_matrix, validation_error, EfResult, StructureError, Tensor};

/// Scalar summary of a set of objective vectors. Lower is better.
pub trait Indicator: Send + Sync {
    fn name(&self) -> &'static str;

    fn compute(&self, objectives: ArrayView2<'_, f64>) -> EfResult<f64>;
}

/// Keep only rows whose entries are all finite.
pub fn mask_non_finite_rows(objectives: ArrayView2<'_, f64>) -> Array2<f64> {
    let keep: Vec<usize> = objectives
        .axis_iter(Axis(0))
        .enumerate()
        .filter(|(_, row)| row.iter().all(|v| v.is_finite()))
        .map(|(i, _)| i)
        .collect();
    objectives.select(Axis(0), &keep)
}

/// Inverted generational distance: mean distance from each reference point
/// to its nearest solution.
#[derive(Debug, Clone)]
pub struct Igd {
    front: Array2<f64>,
}

impl Igd {
    pub fn new(front: &Tensor) -> EfResult<Self> {
        let front = as_matrix(front, "reference front")?.to_owned();
        if front.nrows() == 0 || front.ncols() == 0 {
            return Err(validation_error!("reference front must be non-empty"));
        }
        if front.iter().any(|v| !v.is_finite()) {
            return Err(validation_error!("reference front must be finite"));
        }
        Ok(Self { front })
    }

    pub fn front(&self) -> ArrayView2<'_, f64> {
        self.front.view()
    }
}

impl Indicator for Igd {
    fn name(&self) -> &'static str {
        "igd"
    }

    /// An empty solution set scores `+inf`.
    fn compute(&self, objectives: ArrayView2<'_, f64>) -> EfResult<f64> {
        if objectives.ncols() != self.front.ncols() {
            return Err(StructureError::ShapeMismatch {
                context: "igd objectives".into(),
                expected: vec![objectives.nrows(), self.front.ncols()],
                actual: objectives.shape().to_vec(),
            }
            .into());
        }
        if objectives.nrows() == 0 {
            return Ok(f64::INFINITY);
        }
        let total: f64 = self
            .front
            .axis_iter(Axis(0))
            .map(|reference| {
                objectives
                    .axis_iter(Axis(0))
                    .map(|solution| {
                        reference
                            .iter()
                            .zip(solution.iter())
                            .map(|(r, s)| (r - s).powi(2))
                            .sum::<f64>()
                            .sqrt()
                    })
                    .fold(f64::INFINITY, f64::min)
            })
            .sum();
        Ok(total / self.front.nrows() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ef_types::matrix;
    use ndarray::array;

    #[test]
    fn igd_is_zero_on_the_front() {
        let front = matrix(3, 2, vec![0.0, 1.0, 0.5, 0.5, 1.0, 0.0]).unwrap();
        let igd = Igd::new(&front).unwrap();
        let value = igd.compute(as_matrix(&front, "x").unwrap()).unwrap();
        assert!(value.abs() < 1e-12);
    }

    #[test]
    fn igd_measures_distance() {
        let front = matrix(2, 2, vec![0.0, 0.0, 1.0, 1.0]).unwrap();
        let igd = Igd::new(&front).unwrap();
        let solutions = array![[0.0, 1.0]];
        assert!((igd.compute(solutions.view()).unwrap() - 1.0).abs() < 1e-12);
        let empty = Array2::<f64>::zeros((0, 2));
        assert!(igd.compute(empty.view()).unwrap().is_infinite());
        let wrong = array![[0.0, 1.0, 2.0]];
        assert!(igd.compute(wrong.view()).is_err());
    }

    #[test]
    fn non_finite_rows_are_dropped() {
        let objectives = array![[1.0, 2.0], [f64::NAN, 0.0], [3.0, f64::INFINITY], [0.5, 0.5]];
        let kept = mask_non_finite_rows(objectives.view());
        assert_eq!(kept, array![[1.0, 2.0], [0.5, 0.5]]);
    }

    #[test]
    fn invalid_front_rejected() {
        assert!(Igd::new(&ef_types::vector(vec![1.0, 2.0])).is_err());
        assert!(Igd::new(&matrix(1, 2, vec![f64::NAN, 0.0]).unwrap()).is_err());
    }
}
