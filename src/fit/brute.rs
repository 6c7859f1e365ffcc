//! Brute-force grid search followed by Nelder–Mead refinement.
//!
//! The candidate grid does not depend on the voxel, so the signal of every
//! candidate is simulated once (in parallel) and each voxel only scans the
//! precomputed signals for the lowest SSE. Ties are broken by grid index so
//! the result is independent of scheduling.

use rayon::prelude::*;
use tracing::debug;

use crate::acquisition::AcquisitionScheme;
use crate::domain::{BruteForceOptions, ParameterKind, RefineOptions};
use crate::error::AppError;
use crate::fit::fitter::VoxelSolver;
use crate::fit::refine::{VoxelProblem, refine};
use crate::fit::space::{FractionHandling, SearchSpace};
use crate::math::ols::sum_squared_error;
use crate::math::sphere::{fibonacci_hemisphere, unitvector_to_angles};
use crate::models::MultiCompartmentModel;

#[derive(Debug, Clone, PartialEq)]
enum GridAxis {
    /// Values of one search dimension.
    Values { dim: usize, values: Vec<f64> },
    /// `(θ, φ)` pairs of an orientation starting at `dim`.
    Directions { dim: usize, angles: Vec<[f64; 2]> },
}

impl GridAxis {
    fn len(&self) -> usize {
        match self {
            GridAxis::Values { values, .. } => values.len(),
            GridAxis::Directions { angles, .. } => angles.len(),
        }
    }
}

/// `n` interior points of `[lo, hi]`: `lo + (i + 0.5)(hi - lo)/n`.
pub fn interior_points(lo: f64, hi: f64, n: usize) -> Vec<f64> {
    let n = n.max(1);
    (0..n)
        .map(|i| lo + (i as f64 + 0.5) * (hi - lo) / n as f64)
        .collect()
}

fn build_axes(space: &SearchSpace, grid_points: usize, orientation_points: usize) -> Vec<GridAxis> {
    let bounds = space.bounds();
    let kinds = space.kinds();
    let directions: Vec<[f64; 2]> = fibonacci_hemisphere(orientation_points)
        .iter()
        .map(unitvector_to_angles)
        .collect();

    let mut axes = Vec::new();
    let mut dim = 0;
    while dim < kinds.len() {
        if kinds[dim] == ParameterKind::Orientation {
            axes.push(GridAxis::Directions {
                dim,
                angles: directions.clone(),
            });
            dim += 2;
        } else {
            let (lo, hi) = bounds[dim];
            axes.push(GridAxis::Values {
                dim,
                values: interior_points(lo, hi, grid_points),
            });
            dim += 1;
        }
    }
    axes
}

fn grid_size(axes: &[GridAxis]) -> usize {
    axes.iter().map(GridAxis::len).fold(1usize, |acc, n| acc.saturating_mul(n))
}

/// Shrink the per-axis resolution until the grid fits `max_grid_size`.
fn fitted_axes(space: &SearchSpace, options: &BruteForceOptions) -> Result<Vec<GridAxis>, AppError> {
    let mut grid_points = options.grid_points;
    let mut orientation_points = options.orientation_points;
    loop {
        let axes = build_axes(space, grid_points, orientation_points);
        let size = grid_size(&axes);
        if size <= options.max_grid_size {
            if grid_points != options.grid_points || orientation_points != options.orientation_points {
                debug!(grid_points, orientation_points, size, "reduced brute-force grid");
            }
            return Ok(axes);
        }
        if grid_points > 2 {
            grid_points -= 1;
        } else if orientation_points > 1 {
            orientation_points = (orientation_points / 2).max(1);
        } else if grid_points > 1 {
            grid_points = 1;
        } else {
            return Err(AppError::numeric(format!(
                "Brute-force grid of {size} candidates exceeds the limit of {}.",
                options.max_grid_size
            )));
        }
    }
}

/// Search point of grid candidate `index` (mixed-radix decoding).
fn decode(axes: &[GridAxis], dim: usize, mut index: usize) -> Vec<f64> {
    let mut x = vec![0.0; dim];
    for axis in axes.iter().rev() {
        let n = axis.len();
        let k = index % n;
        index /= n;
        match axis {
            GridAxis::Values { dim, values } => x[*dim] = values[k],
            GridAxis::Directions { dim, angles } => {
                x[*dim] = angles[k][0];
                x[*dim + 1] = angles[k][1];
            }
        }
    }
    x
}

#[derive(Debug, Clone)]
struct Candidate {
    idx: usize,
    x: Vec<f64>,
    signal: Vec<f64>,
}

/// Precomputed candidate signals.
#[derive(Debug, Clone)]
pub struct BruteGrid {
    candidates: Vec<Candidate>,
}

impl BruteGrid {
    pub fn build(
        model: &MultiCompartmentModel,
        scheme: &AcquisitionScheme,
        space: &SearchSpace,
        options: &BruteForceOptions,
    ) -> Result<Self, AppError> {
        let axes = fitted_axes(space, options)?;
        let size = grid_size(&axes);
        let dim = space.dim();

        // Evaluate each candidate independently (parallel).
        let candidates: Vec<Candidate> = (0..size)
            .into_par_iter()
            .filter_map(|idx| {
                let x = decode(&axes, dim, idx);
                let full = model.expand(&space.to_optimized(&x)).ok()?;
                let signal = model.simulate_signal(scheme, &full).ok()?;
                signal.iter().all(|v| v.is_finite()).then_some(Candidate { idx, x, signal })
            })
            .collect();

        if candidates.is_empty() {
            return Err(AppError::numeric("Brute-force grid has no valid candidates."));
        }
        debug!(candidates = candidates.len(), "brute-force grid ready");
        Ok(Self { candidates })
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Best candidate for `data`: minimum SSE, ties broken by grid index.
    pub fn best(&self, data: &[f64]) -> Option<(&[f64], f64)> {
        let mut best: Option<(&Candidate, f64)> = None;
        for c in &self.candidates {
            let sse = sum_squared_error(data, &c.signal);
            if !sse.is_finite() {
                continue;
            }
            let better = match best {
                None => true,
                Some((b, b_sse)) => sse < b_sse || (sse == b_sse && c.idx < b.idx),
            };
            if better {
                best = Some((c, sse));
            }
        }
        best.map(|(c, sse)| (c.x.as_slice(), sse))
    }
}

/// Grid search + refinement.
pub struct Brute2Fine<'a> {
    model: &'a MultiCompartmentModel,
    scheme: &'a AcquisitionScheme,
    space: SearchSpace,
    grid: BruteGrid,
    refine: RefineOptions,
}

impl<'a> Brute2Fine<'a> {
    pub fn new(
        model: &'a MultiCompartmentModel,
        scheme: &'a AcquisitionScheme,
        brute: &BruteForceOptions,
        refine: &RefineOptions,
    ) -> Result<Self, AppError> {
        let space = SearchSpace::new(model, FractionHandling::Nested)?;
        let grid = BruteGrid::build(model, scheme, &space, brute)?;
        Ok(Self {
            model,
            scheme,
            space,
            grid,
            refine: refine.clone(),
        })
    }
}

impl VoxelSolver for Brute2Fine<'_> {
    fn output_parameters(&self) -> Vec<(String, usize)> {
        self.model
            .parameters()
            .iter()
            .map(|p| (p.name.clone(), p.cardinality))
            .collect()
    }

    fn fit_voxel(&self, _index: usize, data: &[f64]) -> Result<Vec<f64>, AppError> {
        let (start, _) = self
            .grid
            .best(data)
            .ok_or_else(|| AppError::numeric("No finite grid candidate for voxel."))?;
        let problem = VoxelProblem::new(self.model, self.scheme, &self.space, data);
        let x = refine(problem, start, &self.refine)?;
        problem.full_vector(&x)
    }
}
