//! Constrained spherical deconvolution.
//!
//! The signal is modelled as the spherical convolution of a fiber orientation
//! distribution (FOD) with a fixed axially symmetric response kernel, plus any
//! number of isotropic (ball) compartments:
//!
//! ```text
//! E(g) = Σ_j c_j λ_l(j)(shell) Y_j(g) + Σ_k f_k exp(-b λ_iso,k)
//! ```
//!
//! Unknowns are the even SH coefficients `c` of the FOD and the isotropic
//! fractions `f`. Solved with Tournier's iterative scheme: an unconstrained
//! low-order fit sets an amplitude threshold, then penalty rows push the FOD
//! up wherever it falls below the threshold until that set stops changing.

use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::acquisition::AcquisitionScheme;
use crate::domain::{CsdOptions, KernelKind, ParameterKind, Representation};
use crate::error::AppError;
use crate::fit::fitter::VoxelSolver;
use crate::math::ols::solve_least_squares;
use crate::math::sh::{n_coefficients, sh_matrix, sh_to_sf};
use crate::math::sphere::{axis_angle, fibonacci_hemisphere, unitvector_to_angles};
use crate::models::{Compartment, MultiCompartmentModel};

/// SH order of the unconstrained initial solution.
const INITIAL_ORDER: usize = 4;
const UNITY_WEIGHT: f64 = 100.0;

/// Name of the SH coefficient output parameter.
pub const SH_COEFF: &str = "sh_coeff";

/// The fixed response: one oriented kernel plus isotropic compartments.
#[derive(Debug, Clone, PartialEq)]
pub struct CsdKernel {
    kernel: KernelKind,
    kernel_parameters: Vec<f64>,
    anisotropic: usize,
    /// `(compartment index, lambda_iso)` of each ball.
    isotropic: Vec<(usize, f64)>,
    n_compartments: usize,
}

impl CsdKernel {
    /// Extract the response from a model whose kernel parameters are all fixed.
    pub fn from_model(model: &MultiCompartmentModel) -> Result<Self, AppError> {
        if model.representation() != Representation::Full {
            return Err(AppError::input("CSD needs the full (per-measurement) representation."));
        }

        let free: Vec<String> = model
            .optimized_parameters()
            .into_iter()
            .filter(|p| p.kind == ParameterKind::Scalar)
            .map(|p| p.name.clone())
            .collect();
        if !free.is_empty() {
            return Err(AppError::input(format!(
                "CSD needs every kernel parameter fixed; free: {}.",
                free.join(", ")
            )));
        }

        let full = model.expand(&vec![0.0; model.optimized_len()])?;
        let mut anisotropic = None;
        let mut isotropic = Vec::new();
        for (i, compartment) in model.compartments().iter().enumerate() {
            let p = model.compartment_parameters(&full, i);
            match compartment {
                Compartment::Ball => isotropic.push((i, p[0])),
                Compartment::Oriented(kernel) => {
                    if anisotropic.is_some() {
                        return Err(AppError::input("CSD supports exactly one anisotropic kernel."));
                    }
                    anisotropic = Some((i, *kernel, p[2..].to_vec()));
                }
                Compartment::Distributed(_) => {
                    return Err(AppError::input("Distributed bundles cannot be used as a CSD kernel."));
                }
            }
        }
        let Some((index, kernel, kernel_parameters)) = anisotropic else {
            return Err(AppError::input("CSD needs one anisotropic kernel (stick, zeppelin or cylinder)."));
        };

        Ok(Self {
            kernel,
            kernel_parameters,
            anisotropic: index,
            isotropic,
            n_compartments: model.n_compartments(),
        })
    }

    pub fn n_isotropic(&self) -> usize {
        self.isotropic.len()
    }

    /// Design matrix: `n_coefficients(lmax)` SH columns, then one column per ball.
    pub fn design_matrix(&self, scheme: &AcquisitionScheme, lmax: usize) -> DMatrix<f64> {
        let n_sh = n_coefficients(lmax);
        let harmonics: Vec<Vec<f64>> = scheme
            .shells()
            .iter()
            .map(|s| self.kernel.rotational_harmonics(s, &self.kernel_parameters, lmax))
            .collect();
        let y = sh_matrix(lmax, scheme.directions());
        let orders: Vec<usize> = crate::math::sh::sh_indices(lmax).into_iter().map(|(l, _)| l).collect();

        let mut a = DMatrix::zeros(scheme.n_measurements(), n_sh + self.isotropic.len());
        for (m, &shell) in scheme.shell_indices().iter().enumerate() {
            for (j, &l) in orders.iter().enumerate() {
                a[(m, j)] = harmonics[shell][l / 2] * y[(m, j)];
            }
            let b = scheme.bvalues()[m];
            for (k, &(_, lambda)) in self.isotropic.iter().enumerate() {
                a[(m, n_sh + k)] = (-b * lambda).exp();
            }
        }
        a
    }

    /// `sh_coeff` followed by a volume fraction per compartment.
    pub fn output_parameters(&self, lmax: usize) -> Vec<(String, usize)> {
        let mut out = vec![(SH_COEFF.to_string(), n_coefficients(lmax))];
        for i in 0..self.n_compartments {
            out.push((format!("partial_volume_{i}"), 1));
        }
        out
    }

    /// Solution vector (`c`, `f`) to the output layout.
    fn to_output(&self, solution: &DVector<f64>, n_sh: usize) -> Vec<f64> {
        let mut out: Vec<f64> = solution.rows(0, n_sh).iter().copied().collect();
        let mut fractions = vec![0.0; self.n_compartments];
        fractions[self.anisotropic] = solution[0] * (4.0 * PI).sqrt();
        for (k, &(i, _)) in self.isotropic.iter().enumerate() {
            fractions[i] = solution[n_sh + k];
        }
        out.extend(fractions);
        out
    }

    /// Attenuation predicted by an output vector (inverse of `to_output`).
    pub fn predict(&self, scheme: &AcquisitionScheme, lmax: usize, output: &[f64]) -> Vec<f64> {
        let n_sh = n_coefficients(lmax);
        let mut solution = DVector::zeros(n_sh + self.isotropic.len());
        for j in 0..n_sh {
            solution[j] = output[j];
        }
        for (k, &(i, _)) in self.isotropic.iter().enumerate() {
            solution[n_sh + k] = output[n_sh + i];
        }
        (self.design_matrix(scheme, lmax) * solution).iter().copied().collect()
    }
}

pub struct Csd {
    kernel: CsdKernel,
    options: CsdOptions,
    n_sh: usize,
    design: DMatrix<f64>,
    initial: DMatrix<f64>,
    initial_sh: usize,
    positivity: DMatrix<f64>,
    penalty_weight: f64,
}

impl Csd {
    pub fn new(model: &MultiCompartmentModel, scheme: &AcquisitionScheme, options: &CsdOptions) -> Result<Self, AppError> {
        model.check_scheme(scheme)?;
        let kernel = CsdKernel::from_model(model)?;
        let lmax = options.sh_order;
        let n_sh = n_coefficients(lmax);
        let n_iso = kernel.n_isotropic();

        let design = kernel.design_matrix(scheme, lmax);
        if design.nrows() < n_sh + n_iso {
            return Err(AppError::data(format!(
                "CSD of order {lmax} needs at least {} measurements, got {}.",
                n_sh + n_iso,
                design.nrows()
            )));
        }

        let initial_sh = n_coefficients(INITIAL_ORDER.min(lmax));
        let columns: Vec<usize> = (0..initial_sh).chain(n_sh..n_sh + n_iso).collect();
        let initial = design.select_columns(&columns);

        let positivity = sh_matrix(lmax, &fibonacci_hemisphere(options.sphere_points));
        let b_norm = positivity.column(0).norm();
        let penalty_weight = if b_norm > 0.0 {
            options.lambda * design.column(0).norm() / b_norm
        } else {
            options.lambda
        };

        Ok(Self {
            kernel,
            options: options.clone(),
            n_sh,
            design,
            initial,
            initial_sh,
            positivity,
            penalty_weight,
        })
    }

    pub fn kernel(&self) -> &CsdKernel {
        &self.kernel
    }

    /// Unity row over `n_sh` SH columns plus the iso columns.
    fn unity_row(&self, n_sh: usize) -> Vec<f64> {
        let mut row = vec![0.0; n_sh + self.kernel.n_isotropic()];
        row[0] = (4.0 * PI).sqrt();
        for v in &mut row[n_sh..] {
            *v = 1.0;
        }
        row
    }

    /// Stack `base` with extra weighted rows and solve.
    fn solve(&self, base: &DMatrix<f64>, data: &[f64], extra: &[Vec<f64>], extra_rhs: &[f64]) -> Result<DVector<f64>, AppError> {
        let rows = base.nrows();
        let cols = base.ncols();
        let mut m = DMatrix::zeros(rows + extra.len(), cols);
        m.view_mut((0, 0), (rows, cols)).copy_from(base);
        for (r, row) in extra.iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                m[(rows + r, c)] = v;
            }
        }
        let mut rhs = DVector::zeros(rows + extra.len());
        rhs.rows_mut(0, rows).copy_from_slice(data);
        for (r, &v) in extra_rhs.iter().enumerate() {
            rhs[rows + r] = v;
        }
        solve_least_squares(&m, &rhs).ok_or_else(|| AppError::numeric("CSD least-squares solve failed."))
    }

    /// Deconvolve one voxel; returns `(c, f)` in solver layout.
    pub fn deconvolve(&self, data: &[f64]) -> Result<DVector<f64>, AppError> {
        let n_sh = self.n_sh;
        let n_iso = self.kernel.n_isotropic();

        let (init_extra, init_rhs) = if self.options.unity_constraint {
            let row: Vec<f64> = self.unity_row(self.initial_sh).iter().map(|v| v * UNITY_WEIGHT).collect();
            (vec![row], vec![UNITY_WEIGHT])
        } else {
            (Vec::new(), Vec::new())
        };
        let init = self.solve(&self.initial, data, &init_extra, &init_rhs)?;

        let mut solution = DVector::zeros(n_sh + n_iso);
        for j in 0..self.initial_sh {
            solution[j] = init[j];
        }
        for k in 0..n_iso {
            solution[n_sh + k] = init[self.initial_sh + k];
        }

        let fod = &self.positivity * solution.rows(0, n_sh);
        let mean = fod.mean();
        let threshold = if mean > 0.0 { self.options.tau * mean } else { 0.0 };

        let mut previous: Option<(Vec<usize>, Vec<usize>)> = None;
        for iteration in 0..self.options.max_iters {
            let fod = &self.positivity * solution.rows(0, n_sh);
            let negative: Vec<usize> = (0..fod.len()).filter(|&i| fod[i] < threshold).collect();
            let negative_iso: Vec<usize> = (0..n_iso).filter(|&k| solution[n_sh + k] < 0.0).collect();
            let current = (negative, negative_iso);
            if previous.as_ref() == Some(&current) {
                debug!(iteration, "CSD converged");
                break;
            }

            let mut extra = Vec::new();
            let mut rhs = Vec::new();
            for &i in &current.0 {
                let mut row: Vec<f64> = self.positivity.row(i).iter().map(|v| v * self.penalty_weight).collect();
                row.extend(std::iter::repeat_n(0.0, n_iso));
                extra.push(row);
                rhs.push(0.0);
            }
            for &k in &current.1 {
                let mut row = vec![0.0; n_sh + n_iso];
                row[n_sh + k] = self.penalty_weight;
                extra.push(row);
                rhs.push(0.0);
            }
            if self.options.unity_constraint {
                extra.push(self.unity_row(n_sh).iter().map(|v| v * UNITY_WEIGHT).collect());
                rhs.push(UNITY_WEIGHT);
            }
            solution = self.solve(&self.design, data, &extra, &rhs)?;
            previous = Some(current);
        }
        Ok(solution)
    }
}

impl VoxelSolver for Csd {
    fn output_parameters(&self) -> Vec<(String, usize)> {
        self.kernel.output_parameters(self.options.sh_order)
    }

    fn fit_voxel(&self, _index: usize, data: &[f64]) -> Result<Vec<f64>, AppError> {
        let solution = self.deconvolve(data)?;
        if solution.iter().any(|v| !v.is_finite()) {
            return Err(AppError::numeric("CSD produced non-finite coefficients."));
        }
        Ok(self.kernel.to_output(&solution, self.n_sh))
    }
}

/// Peak search settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakOptions {
    /// Hemisphere points on which the FOD is evaluated.
    pub sphere_points: usize,
    /// Peaks below this fraction of the largest peak are dropped.
    pub relative_threshold: f64,
    /// Minimum angle between peaks (degrees).
    pub min_separation_deg: f64,
    pub max_peaks: usize,
}

impl Default for PeakOptions {
    fn default() -> Self {
        Self {
            sphere_points: 1_000,
            relative_threshold: 0.5,
            min_separation_deg: 25.0,
            max_peaks: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub direction: [f64; 3],
    /// `[θ, φ]`.
    pub angles: [f64; 2],
    pub amplitude: f64,
}

/// Local maxima of an FOD, strongest first.
pub fn find_peaks(coefficients: &[f64], lmax: usize, options: &PeakOptions) -> Vec<Peak> {
    let points = fibonacci_hemisphere(options.sphere_points);
    let values = sh_to_sf(coefficients, lmax, &points);
    let radius = options.min_separation_deg.to_radians();

    let mut maxima: Vec<usize> = (0..points.len())
        .filter(|&i| {
            values[i] > 0.0
                && (0..points.len()).all(|j| {
                    j == i
                        || axis_angle(&points[i], &points[j]) >= radius
                        || values[i] > values[j]
                        || (values[i] == values[j] && i < j)
                })
        })
        .collect();
    maxima.sort_by(|&a, &b| values[b].partial_cmp(&values[a]).unwrap_or(std::cmp::Ordering::Equal).then(a.cmp(&b)));

    let Some(&top) = maxima.first() else {
        return Vec::new();
    };
    let cutoff = options.relative_threshold * values[top];

    let mut kept: Vec<usize> = Vec::new();
    for i in maxima {
        if kept.len() >= options.max_peaks || values[i] < cutoff {
            break;
        }
        if kept.iter().all(|&k| axis_angle(&points[i], &points[k]) >= radius) {
            kept.push(i);
        }
    }

    kept.into_iter()
        .map(|i| {
            let d: Vector3<f64> = points[i];
            Peak {
                direction: [d.x, d.y, d.z],
                angles: unitvector_to_angles(&d),
                amplitude: values[i],
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::presets::hcp_like;
    use crate::math::sphere::angles_to_unitvector;

    fn stick_model(fixed_lambda: bool) -> MultiCompartmentModel {
        let mut model = MultiCompartmentModel::new(vec![Compartment::stick()]).unwrap();
        if fixed_lambda {
            model.set_fixed_parameter("C1Stick_1_lambda_par", vec![1.7e-9]).unwrap();
        }
        model
    }

    #[test]
    fn free_kernel_parameters_are_rejected() {
        let err = CsdKernel::from_model(&stick_model(false)).unwrap_err();
        assert!(err.message().contains("C1Stick_1_lambda_par"));
        let balls = MultiCompartmentModel::new(vec![Compartment::Ball]).unwrap();
        assert!(CsdKernel::from_model(&balls).is_err());
    }

    #[test]
    fn single_stick_is_recovered() {
        let scheme = hcp_like().unwrap();
        let model = stick_model(true);
        let truth = [0.5, 0.3, 1.7e-9];
        let data = model.simulate_signal(&scheme, &truth).unwrap();

        let csd = Csd::new(&model, &scheme, &CsdOptions::default()).unwrap();
        let out = csd.fit_voxel(0, &data).unwrap();
        let n_sh = n_coefficients(8);
        assert_eq!(out.len(), n_sh + 1);
        assert!((out[n_sh] - 1.0).abs() < 0.05, "vf = {}", out[n_sh]);

        let peaks = find_peaks(&out[..n_sh], 8, &PeakOptions::default());
        assert!(!peaks.is_empty());
        let p = &peaks[0].direction;
        let angle = axis_angle(&Vector3::new(p[0], p[1], p[2]), &angles_to_unitvector(0.5, 0.3));
        assert!(angle.to_degrees() < 6.0, "peak off by {} deg", angle.to_degrees());
    }

    #[test]
    fn design_matrix_reproduces_isotropic_signal() {
        let scheme = hcp_like().unwrap();
        let mut model = MultiCompartmentModel::new(vec![Compartment::stick(), Compartment::Ball]).unwrap();
        model.set_fixed_parameter("C1Stick_1_lambda_par", vec![1.7e-9]).unwrap();
        model.set_fixed_parameter("G1Ball_1_lambda_iso", vec![3e-9]).unwrap();
        let kernel = CsdKernel::from_model(&model).unwrap();
        let a = kernel.design_matrix(&scheme, 4);
        assert_eq!(a.ncols(), n_coefficients(4) + 1);
        let b = scheme.bvalues()[20];
        assert!((a[(20, n_coefficients(4))] - (-b * 3e-9).exp()).abs() < 1e-14);
    }
}
