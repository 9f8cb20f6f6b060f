//! Benchmark problems over dense `(n, dim)` candidate batches.

use std::f64::consts::PI;

use ndarray::{Array1, ArrayView1, Axis};

use ef_types::{as_matrix, Candidates, EfResult, InputSpec, LocalState, Module, Problem, StepContext, Tensor};

fn evaluate_rows(candidates: &Candidates, f: impl Fn(ArrayView1<'_, f64>) -> f64) -> EfResult<Tensor> {
    let batch = as_matrix(candidates.as_dense()?, "candidates")?;
    let fitness: Array1<f64> = batch.axis_iter(Axis(0)).map(f).collect();
    Ok(fitness.into_dyn())
}

/// Sum of squares, minimum 0 at the origin.
#[derive(Debug, Clone, Default)]
pub struct Sphere;

impl Sphere {
    pub fn new() -> Self {
        Self
    }
}

impl Module for Sphere {}

impl Problem for Sphere {
    fn input_spec(&self) -> InputSpec {
        InputSpec::Dense { dim: None }
    }

    fn evaluate(
        &self,
        _ctx: &mut StepContext<'_>,
        local: &LocalState,
        candidates: &Candidates,
    ) -> EfResult<(Tensor, LocalState)> {
        let fitness = evaluate_rows(candidates, |x| x.dot(&x))?;
        Ok((fitness, local.clone()))
    }
}

/// Ackley function, minimum 0 at the origin.
#[derive(Debug, Clone)]
pub struct Ackley {
    a: f64,
    b: f64,
    c: f64,
}

impl Ackley {
    pub fn new() -> Self {
        Self {
            a: 20.0,
            b: 0.2,
            c: 2.0 * PI,
        }
    }

    pub fn with_coefficients(a: f64, b: f64, c: f64) -> Self {
        Self { a, b, c }
    }

    fn value(&self, x: ArrayView1<'_, f64>) -> f64 {
        let d = x.len() as f64;
        let mean_sq = x.dot(&x) / d;
        let mean_cos = x.iter().map(|v| (self.c * v).cos()).sum::<f64>() / d;
        -self.a * (-self.b * mean_sq.sqrt()).exp() - mean_cos.exp() + self.a + std::f64::consts::E
    }
}

impl Default for Ackley {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for Ackley {}

impl Problem for Ackley {
    fn input_spec(&self) -> InputSpec {
        InputSpec::Dense { dim: None }
    }

    fn evaluate(
        &self,
        _ctx: &mut StepContext<'_>,
        local: &LocalState,
        candidates: &Candidates,
    ) -> EfResult<(Tensor, LocalState)> {
        let fitness = evaluate_rows(candidates, |x| self.value(x))?;
        Ok((fitness, local.clone()))
    }
}
