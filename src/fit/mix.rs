//! MIX: three-stage fitting of multi-compartment models.
//!
//! 1. Differential evolution over the non-linear parameters. Fractions enter
//!    the signal linearly, so for every candidate they are solved by NNLS on
//!    the compartment-signal matrix.
//! 2. Fractions re-estimated with the stage-1 optimum held fixed: NNLS with a
//!    heavily weighted `Σ f = 1` row, then projected onto the simplex.
//! 3. Joint Nelder–Mead refinement of all parameters from the stage-2 point.
//!
//! When links read or write fractions (e.g. tortuosity) the fractions cannot
//! be separated; stage 1 then searches them too (nested on the simplex) and
//! stage 2 is skipped.
//!
//! Every voxel seeds its own RNG with `seed + voxel index`, so results do not
//! depend on thread scheduling.

use nalgebra::{DMatrix, DVector};
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Uniform;

use crate::acquisition::AcquisitionScheme;
use crate::domain::{MixOptions, RefineOptions};
use crate::error::AppError;
use crate::fit::fitter::VoxelSolver;
use crate::fit::refine::{VoxelProblem, refine};
use crate::fit::space::{FractionHandling, SearchSpace};
use crate::math::nnls::nnls;
use crate::math::ols::sum_squared_error;
use crate::models::MultiCompartmentModel;

const UNITY_WEIGHT: f64 = 100.0;
const NNLS_MAX_ITER: usize = 100;
const MIN_POPULATION: usize = 8;

pub struct Mix<'a> {
    model: &'a MultiCompartmentModel,
    scheme: &'a AcquisitionScheme,
    /// Stage-1 space (fractions excluded when separable).
    stage1: SearchSpace,
    /// Stage-3 space (nested fractions).
    joint: SearchSpace,
    separable: bool,
    mix: MixOptions,
    refine: RefineOptions,
}

impl<'a> Mix<'a> {
    pub fn new(
        model: &'a MultiCompartmentModel,
        scheme: &'a AcquisitionScheme,
        mix: &MixOptions,
        refine: &RefineOptions,
    ) -> Result<Self, AppError> {
        let joint = SearchSpace::new(model, FractionHandling::Nested)?;
        let separable = model.n_compartments() > 1 && !model.links_involve_fractions();
        let stage1 = if separable {
            SearchSpace::new(model, FractionHandling::Excluded)?
        } else {
            joint.clone()
        };
        Ok(Self {
            model,
            scheme,
            stage1,
            joint,
            separable,
            mix: mix.clone(),
            refine: refine.clone(),
        })
    }

    /// Compartment-signal matrix at a stage-1 search point.
    fn columns(&self, x: &[f64]) -> Result<DMatrix<f64>, AppError> {
        let full = self.model.expand(&self.stage1.to_optimized(x))?;
        self.model.compartment_signals(self.scheme, &full)
    }

    /// Stage-1 objective: SSE with the best non-negative fractions.
    fn separable_cost(&self, x: &[f64], data: &DVector<f64>) -> f64 {
        let Ok(a) = self.columns(x) else {
            return f64::INFINITY;
        };
        let Some(f) = nnls(&a, data, NNLS_MAX_ITER) else {
            return f64::INFINITY;
        };
        let r = &a * f - data;
        let sse = r.norm_squared();
        if sse.is_finite() { sse } else { f64::INFINITY }
    }

    fn stage1_cost(&self, x: &[f64], data: &[f64], data_vec: &DVector<f64>) -> f64 {
        if self.separable {
            self.separable_cost(x, data_vec)
        } else {
            VoxelProblem::new(self.model, self.scheme, &self.stage1, data).sse(x)
        }
    }

    /// Differential evolution (rand/1/bin) inside the stage-1 box.
    fn differential_evolution(&self, index: usize, data: &[f64]) -> Vec<f64> {
        let bounds = self.stage1.bounds();
        let dim = bounds.len();
        if dim == 0 {
            return Vec::new();
        }
        let data_vec = DVector::from_column_slice(data);
        let mut rng = StdRng::seed_from_u64(self.mix.seed.wrapping_add(index as u64));
        let unit = Uniform::new(0.0, 1.0);

        let np = (self.mix.population_factor * dim).max(MIN_POPULATION);
        let mut population: Vec<Vec<f64>> = (0..np)
            .map(|_| bounds.iter().map(|&(lo, hi)| lo + (hi - lo) * rng.sample(unit)).collect())
            .collect();
        let mut costs: Vec<f64> = population
            .iter()
            .map(|x| self.stage1_cost(x, data, &data_vec))
            .collect();

        for _ in 0..self.mix.generations {
            for i in 0..np {
                let (a, b, c) = pick_three(&mut rng, np, i);
                let forced = rng.gen_range(0..dim);
                let mut trial = population[i].clone();
                for j in 0..dim {
                    if j == forced || rng.sample(unit) < self.mix.crossover {
                        let v = population[a][j] + self.mix.mutation * (population[b][j] - population[c][j]);
                        let (lo, hi) = bounds[j];
                        trial[j] = reflect(v, lo, hi);
                    }
                }
                let cost = self.stage1_cost(&trial, data, &data_vec);
                if cost <= costs[i] {
                    population[i] = trial;
                    costs[i] = cost;
                }
            }
        }

        // Lowest cost; ties go to the lowest population index.
        let mut best = 0;
        for i in 1..np {
            if costs[i] < costs[best] {
                best = i;
            }
        }
        population.swap_remove(best)
    }

    /// Stage 2: fractions on the simplex with the non-linear parameters fixed.
    fn fractions(&self, x: &[f64], data: &[f64]) -> Result<Vec<f64>, AppError> {
        let a = self.columns(x)?;
        let n = a.ncols();
        let rows = a.nrows();
        let mut aug = DMatrix::zeros(rows + 1, n);
        aug.view_mut((0, 0), (rows, n)).copy_from(&a);
        for j in 0..n {
            aug[(rows, j)] = UNITY_WEIGHT;
        }
        let mut rhs = DVector::zeros(rows + 1);
        rhs.rows_mut(0, rows).copy_from_slice(data);
        rhs[rows] = UNITY_WEIGHT;

        let f = nnls(&aug, &rhs, NNLS_MAX_ITER)
            .ok_or_else(|| AppError::numeric("NNLS fraction estimate failed."))?;
        let total: f64 = f.iter().sum();
        if !(total > 0.0 && total.is_finite()) {
            return Err(AppError::numeric("Estimated fractions sum to zero."));
        }
        Ok(f.iter().map(|v| v / total).collect())
    }
}

impl VoxelSolver for Mix<'_> {
    fn output_parameters(&self) -> Vec<(String, usize)> {
        self.model
            .parameters()
            .iter()
            .map(|p| (p.name.clone(), p.cardinality))
            .collect()
    }

    fn fit_voxel(&self, index: usize, data: &[f64]) -> Result<Vec<f64>, AppError> {
        let x1 = self.differential_evolution(index, data);

        let optimized = if self.separable {
            let fractions = self.fractions(&x1, data)?;
            self.stage1.to_optimized_with_fractions(&x1, &fractions)
        } else {
            self.stage1.to_optimized(&x1)
        };

        let start = self.joint.from_optimized(&optimized);
        let problem = VoxelProblem::new(self.model, self.scheme, &self.joint, data);
        let x3 = refine(problem, &start, &self.refine)?;

        // Keep the stage-2 point if refinement did not improve on it.
        let best = if problem.sse(&x3) <= problem.sse(&start) { x3 } else { start };
        let full = problem.full_vector(&best)?;
        let signal = self.model.simulate_signal(self.scheme, &full)?;
        if !sum_squared_error(data, &signal).is_finite() {
            return Err(AppError::numeric("MIX produced a non-finite fit."));
        }
        Ok(full)
    }
}

/// Three distinct population indices, all different from `i`.
fn pick_three(rng: &mut StdRng, np: usize, i: usize) -> (usize, usize, usize) {
    let a = pick_excluding(rng, np, &[i]);
    let b = pick_excluding(rng, np, &[i, a]);
    let c = pick_excluding(rng, np, &[i, a, b]);
    (a, b, c)
}

fn pick_excluding(rng: &mut StdRng, np: usize, exclude: &[usize]) -> usize {
    loop {
        let k = rng.gen_range(0..np);
        if !exclude.contains(&k) {
            return k;
        }
    }
}

/// Mirror `v` back into `[lo, hi]`.
fn reflect(v: f64, lo: f64, hi: f64) -> f64 {
    if !v.is_finite() {
        return lo;
    }
    let r = if v < lo {
        lo + (lo - v)
    } else if v > hi {
        hi - (v - hi)
    } else {
        v
    };
    r.clamp(lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::presets::hcp_like;
    use crate::models::Compartment;

    #[test]
    fn reflect_stays_in_bounds() {
        assert!((reflect(1.2, 0.0, 1.0) - 0.8).abs() < 1e-12);
        assert!((reflect(-0.3, 0.0, 1.0) - 0.3).abs() < 1e-12);
        assert_eq!(reflect(5.0, 0.0, 1.0), 0.0);
        assert_eq!(reflect(f64::NAN, 0.0, 1.0), 0.0);
    }

    #[test]
    fn pick_three_is_distinct() {
        let mut rng = StdRng::seed_from_u64(1);
        for i in 0..10 {
            let (a, b, c) = pick_three(&mut rng, 10, i);
            assert!(a != i && b != i && c != i && a != b && b != c && a != c);
        }
    }

    #[test]
    fn stage_two_fractions_sum_to_one() {
        let scheme = hcp_like().unwrap();
        let model = MultiCompartmentModel::new(vec![Compartment::stick(), Compartment::Ball]).unwrap();
        let truth = [0.4, 1.1, 1.7e-9, 3.0e-9, 0.65, 0.35];
        let data = model.simulate_signal(&scheme, &truth).unwrap();
        let mix = Mix::new(&model, &scheme, &MixOptions::default(), &RefineOptions::default()).unwrap();

        let x = mix.stage1.from_optimized(&model.compress(&truth).unwrap());
        let f = mix.fractions(&x, &data).unwrap();
        assert!((f.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((f[0] - 0.65).abs() < 1e-6);
    }

    #[test]
    fn same_seed_same_result() {
        let scheme = hcp_like().unwrap();
        let model = MultiCompartmentModel::new(vec![Compartment::Ball]).unwrap();
        let data = model.simulate_signal(&scheme, &[1.3e-9]).unwrap();
        let options = MixOptions {
            generations: 10,
            ..MixOptions::default()
        };
        let mix = Mix::new(&model, &scheme, &options, &RefineOptions::default()).unwrap();
        let a = mix.fit_voxel(3, &data).unwrap();
        let b = mix.fit_voxel(3, &data).unwrap();
        assert_eq!(a, b);
        assert!((a[0] - 1.3e-9).abs() < 1e-12);
    }
}
