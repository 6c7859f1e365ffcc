//! Volume fitting: data preparation and the parallel voxel map.
//!
//! Given:
//! - an acquisition scheme
//! - a voxel × measurement signal matrix
//! - a multi-compartment model and a solver configuration
//!
//! we:
//! - normalise every voxel by its mean b0 signal (`E = S / S0`)
//! - reduce to per-shell means for spherical-mean models
//! - fit each voxel independently (parallel)
//!
//! and collect the results into a `FittedModel`. A voxel that cannot be
//! fitted is reported as failed (`NaN` parameters) without aborting the run.

use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::acquisition::AcquisitionScheme;
use crate::domain::{FitConfig, Representation, SignalMatrix, SolverKind};
use crate::error::AppError;
use crate::fit::brute::Brute2Fine;
use crate::fit::csd::Csd;
use crate::fit::fitted::FittedModel;
use crate::fit::mix::Mix;
use crate::models::MultiCompartmentModel;

/// A per-voxel optimizer. Implementations hold only shared, immutable state.
pub trait VoxelSolver: Sync {
    /// Names and cardinalities of the vector `fit_voxel` returns.
    fn output_parameters(&self) -> Vec<(String, usize)>;

    /// Fit one voxel. `data` is the prepared (normalised) signal.
    fn fit_voxel(&self, index: usize, data: &[f64]) -> Result<Vec<f64>, AppError>;
}

/// Normalised signal ready for fitting.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSignal {
    pub attenuation: Vec<Vec<f64>>,
    pub s0: Vec<f64>,
    pub valid: Vec<bool>,
}

/// Per-shell mean of a per-measurement signal.
pub fn spherical_mean_signal(scheme: &AcquisitionScheme, signal: &[f64]) -> Vec<f64> {
    scheme
        .shells()
        .iter()
        .map(|s| s.measurements.iter().map(|&i| signal[i]).sum::<f64>() / s.measurements.len() as f64)
        .collect()
}

/// Normalise by the mean b0 signal and reduce to the model representation.
pub fn prepare_signal(
    scheme: &AcquisitionScheme,
    data: &SignalMatrix,
    representation: Representation,
) -> Result<PreparedSignal, AppError> {
    if data.n_measurements() != scheme.n_measurements() {
        return Err(AppError::input(format!(
            "Signal has {} measurements per voxel but the scheme has {}.",
            data.n_measurements(),
            scheme.n_measurements()
        )));
    }
    let b0 = scheme.b0_indices();
    if b0.is_empty() {
        return Err(AppError::data("The acquisition scheme has no b0 measurements to estimate S0."));
    }

    let mut attenuation = Vec::with_capacity(data.n_voxels());
    let mut s0 = Vec::with_capacity(data.n_voxels());
    let mut valid = Vec::with_capacity(data.n_voxels());
    for voxel in data.rows() {
        let s = b0.iter().map(|&i| voxel[i]).sum::<f64>() / b0.len() as f64;
        let ok = s.is_finite() && s > 0.0 && voxel.iter().all(|v| v.is_finite());
        let e: Vec<f64> = if ok {
            voxel.iter().map(|v| v / s).collect()
        } else {
            vec![f64::NAN; voxel.len()]
        };
        attenuation.push(match representation {
            Representation::Full => e,
            Representation::SphericalMean => spherical_mean_signal(scheme, &e),
        });
        s0.push(s);
        valid.push(ok);
    }
    Ok(PreparedSignal { attenuation, s0, valid })
}

/// Fit `model` to every voxel of `data`.
pub fn fit(
    model: &MultiCompartmentModel,
    scheme: &AcquisitionScheme,
    data: &SignalMatrix,
    config: &FitConfig,
) -> Result<FittedModel, AppError> {
    config.validate()?;
    model.check_scheme(scheme)?;
    if data.n_voxels() == 0 {
        return Err(AppError::data("No voxels to fit."));
    }

    let representation = model.representation();
    let prepared = prepare_signal(scheme, data, representation)?;
    let n_voxels = data.n_voxels();

    info!(
        voxels = n_voxels,
        solver = config.solver.display_name(),
        parameters = model.optimized_len(),
        "fitting started"
    );
    let start = Instant::now();

    let solver: Box<dyn VoxelSolver + '_> = match config.solver {
        SolverKind::Brute2Fine => Box::new(Brute2Fine::new(model, scheme, &config.brute, &config.refine)?),
        SolverKind::Mix => Box::new(Mix::new(model, scheme, &config.mix, &config.refine)?),
        SolverKind::Csd => Box::new(Csd::new(model, scheme, &config.csd)?),
    };
    debug!(setup_ms = start.elapsed().as_millis() as u64, "solver ready");

    let outputs = solver.output_parameters();
    let output_len: usize = outputs.iter().map(|(_, n)| n).sum();

    let run = || -> Vec<Result<Vec<f64>, AppError>> {
        (0..n_voxels)
            .into_par_iter()
            .map(|i| {
                if !prepared.valid[i] {
                    return Err(AppError::data("voxel has no positive, finite b0 signal"));
                }
                solver.fit_voxel(i, &prepared.attenuation[i])
            })
            .collect()
    };
    let results = match config.threads {
        Some(threads) => rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| AppError::input(format!("Failed to build thread pool: {e}")))?
            .install(run),
        None => run(),
    };

    let normalisation = fraction_normalisation(model, config.solver);
    let mut parameters = Vec::with_capacity(n_voxels);
    let mut success = Vec::with_capacity(n_voxels);
    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(mut p) if p.len() == output_len => {
                if let Some((positions, budget)) = &normalisation {
                    normalise_fractions(&mut p, positions, *budget);
                }
                parameters.push(p);
                success.push(true);
            }
            Ok(p) => {
                warn!(voxel = i, got = p.len(), expected = output_len, "voxel fit returned a malformed vector");
                parameters.push(vec![f64::NAN; output_len]);
                success.push(false);
            }
            Err(e) => {
                warn!(voxel = i, error = %e, "voxel fit failed");
                parameters.push(vec![f64::NAN; output_len]);
                success.push(false);
            }
        }
    }

    let failed = success.iter().filter(|ok| !**ok).count();
    let elapsed = start.elapsed();
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        per_voxel_ms = elapsed.as_secs_f64() * 1e3 / n_voxels as f64,
        failed,
        "fitting finished"
    );

    let csd = match config.solver {
        SolverKind::Csd => Some((crate::fit::csd::CsdKernel::from_model(model)?, config.csd.sh_order)),
        _ => None,
    };

    Ok(FittedModel::new(
        model.clone(),
        config.solver,
        outputs,
        parameters,
        success,
        prepared.s0,
        csd,
    ))
}

/// Free partial volumes are rescaled to fill what fixed ones leave of the
/// simplex. Fractions tied by other links are left as fitted.
fn fraction_normalisation(model: &MultiCompartmentModel, solver: SolverKind) -> Option<(Vec<usize>, f64)> {
    if solver == SolverKind::Csd {
        return None;
    }
    let budget = model.free_fraction_budget()?;
    Some((model.free_fraction_positions(), budget))
}

fn normalise_fractions(p: &mut [f64], positions: &[usize], budget: f64) {
    let total: f64 = positions.iter().map(|&i| p[i]).sum();
    if total > 0.0 && total.is_finite() {
        for &i in positions {
            p[i] *= budget / total;
        }
    }
}
