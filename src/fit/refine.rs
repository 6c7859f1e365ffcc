//! Per-voxel objective and bounded Nelder–Mead refinement.
//!
//! The objective is the sum of squared errors between the data and the model
//! signal at the *clamped* search point, plus a quadratic penalty on the
//! distance outside the box. The simplex therefore never evaluates the model
//! outside its bounds but still feels a pull back towards them.

use argmin::core::{CostFunction, Error, Executor};
use argmin::solver::neldermead::NelderMead;

use crate::acquisition::AcquisitionScheme;
use crate::domain::RefineOptions;
use crate::error::AppError;
use crate::fit::space::SearchSpace;
use crate::math::ols::sum_squared_error;
use crate::models::MultiCompartmentModel;

const BOUND_PENALTY: f64 = 10.0;

/// Initial simplex step as a fraction of each box width.
const SIMPLEX_STEP: f64 = 0.05;

/// Model + data of one voxel, evaluated in search units.
#[derive(Clone, Copy)]
pub struct VoxelProblem<'a> {
    pub model: &'a MultiCompartmentModel,
    pub scheme: &'a AcquisitionScheme,
    pub space: &'a SearchSpace,
    pub data: &'a [f64],
}

impl<'a> VoxelProblem<'a> {
    pub fn new(
        model: &'a MultiCompartmentModel,
        scheme: &'a AcquisitionScheme,
        space: &'a SearchSpace,
        data: &'a [f64],
    ) -> Self {
        Self {
            model,
            scheme,
            space,
            data,
        }
    }

    /// Full parameter vector of a search point.
    pub fn full_vector(&self, x: &[f64]) -> Result<Vec<f64>, AppError> {
        self.model.expand(&self.space.to_optimized(x))
    }

    pub fn predict(&self, x: &[f64]) -> Result<Vec<f64>, AppError> {
        self.model.simulate_signal(self.scheme, &self.full_vector(x)?)
    }

    /// SSE at a search point; `inf` when the model cannot be evaluated.
    pub fn sse(&self, x: &[f64]) -> f64 {
        match self.predict(x) {
            Ok(signal) => {
                let sse = sum_squared_error(self.data, &signal);
                if sse.is_finite() { sse } else { f64::INFINITY }
            }
            Err(_) => f64::INFINITY,
        }
    }
}

impl CostFunction for VoxelProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> Result<Self::Output, Error> {
        Ok(self.sse(x) + BOUND_PENALTY * self.space.excess(x))
    }
}

/// Refine `start` with Nelder–Mead; returns the best (clamped) search point.
pub fn refine(problem: VoxelProblem<'_>, start: &[f64], options: &RefineOptions) -> Result<Vec<f64>, AppError> {
    if start.is_empty() {
        return Ok(Vec::new());
    }
    let space = problem.space;
    let simplex = initial_simplex(start, &space.bounds());

    let solver: NelderMead<Vec<f64>, f64> = NelderMead::new(simplex)
        .with_sd_tolerance(options.tolerance)
        .map_err(|e| AppError::numeric(format!("Invalid Nelder–Mead settings: {e}")))?;

    let max_iters = options.max_iters;
    let res = Executor::new(problem, solver)
        .configure(|state| state.max_iters(max_iters))
        .run()
        .map_err(|e| AppError::numeric(format!("Nelder–Mead refinement failed: {e}")))?;

    let best = res.state.best_param.unwrap_or_else(|| start.to_vec());
    Ok(space.clamp(&best))
}

/// Start point plus one vertex per dimension, stepped inwards.
fn initial_simplex(start: &[f64], bounds: &[(f64, f64)]) -> Vec<Vec<f64>> {
    let mut vertices = Vec::with_capacity(start.len() + 1);
    vertices.push(start.to_vec());
    for (i, &(lo, hi)) in bounds.iter().enumerate() {
        let width = hi - lo;
        let step = if width > 0.0 { SIMPLEX_STEP * width } else { 1e-3 };
        let mut vertex = start.to_vec();
        vertex[i] = if start[i] + step <= hi || width <= 0.0 {
            start[i] + step
        } else {
            start[i] - step
        };
        vertices.push(vertex);
    }
    vertices
}
