//! Shared pipeline steps used by the `fit`, `simulate` and `camino` commands.
//!
//! scheme + model file -> signal -> fit -> quality measures -> recovery vs truth
//!
//! The command handlers in `app` only do presentation and file output.

use std::path::Path;
use std::time::Instant;

use crate::acquisition::AcquisitionScheme;
use crate::acquisition::presets::hcp_like;
use crate::cli::{SchemeArgs, SchemePreset};
use crate::data::camino::{CaminoData, STATIC_DIFFUSIVITY};
use crate::domain::{FitConfig, SignalMatrix};
use crate::error::AppError;
use crate::fit::{FittedModel, fit};
use crate::io::{ModelFile, TimingArgs, read_fsl_scheme, read_model_file};
use crate::models::MultiCompartmentModel;
use crate::report::stats::{Recovery, recovery};

pub fn load_scheme(args: &SchemeArgs) -> Result<AcquisitionScheme, AppError> {
    match (args.preset, &args.bvals, &args.bvecs) {
        (Some(SchemePreset::Hcp), _, _) => hcp_like(),
        (None, Some(bvals), Some(bvecs)) => {
            let timing = TimingArgs {
                delta: args.delta,
                big_delta: args.big_delta,
                echo_time: args.echo_time,
            };
            read_fsl_scheme(bvals, bvecs, timing)
        }
        _ => Err(AppError::input("Provide an acquisition scheme: --preset hcp or --bvals/--bvecs.")),
    }
}

#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub file: ModelFile,
    pub model: MultiCompartmentModel,
}

pub fn load_model(path: &Path) -> Result<LoadedModel, AppError> {
    let file = read_model_file(path)?;
    let model = file.build()?;
    Ok(LoadedModel { file, model })
}

/// All computed outputs of a single fit.
#[derive(Debug, Clone)]
pub struct FitRun {
    pub fitted: FittedModel,
    pub mse: Vec<f64>,
    pub r2: Vec<f64>,
    pub elapsed_secs: f64,
}

pub fn run_fit(
    model: &MultiCompartmentModel,
    scheme: &AcquisitionScheme,
    data: &SignalMatrix,
    config: &FitConfig,
) -> Result<FitRun, AppError> {
    let start = Instant::now();
    let fitted = fit(model, scheme, data, config)?;
    let elapsed_secs = start.elapsed().as_secs_f64();
    let mse = fitted.mean_squared_error(scheme, data)?;
    let r2 = fitted.r2(scheme, data)?;
    Ok(FitRun {
        fitted,
        mse,
        r2,
        elapsed_secs,
    })
}

/// Recovery of every scalar output that also exists in the ground-truth
/// vectors (full parameter vectors of `model`). Multi-tissue truth holds
/// volume fractions, so partial volumes are compared as `volume_fraction_<i>`.
pub fn truth_recovery(
    model: &MultiCompartmentModel,
    fitted: &FittedModel,
    truth: &[Vec<f64>],
) -> Result<Vec<Recovery>, AppError> {
    if truth.len() != fitted.n_voxels() {
        return Err(AppError::input(format!(
            "Ground truth has {} rows, the fit has {} voxels.",
            truth.len(),
            fitted.n_voxels()
        )));
    }
    if let Some(row) = truth.iter().find(|r| r.len() != model.full_len()) {
        return Err(AppError::input(format!(
            "Ground-truth rows have {} values, the model has {} parameters.",
            row.len(),
            model.full_len()
        )));
    }

    let volume_fractions = match model.s0_responses() {
        Some(_) => Some(fitted.volume_fractions()?),
        None => None,
    };
    let mut out = Vec::new();
    for (name, &n) in fitted.parameter_names().iter().zip(fitted.parameter_cardinalities()) {
        if n != 1 || model.is_linked(name) {
            continue;
        }
        let Ok(range) = model.parameter_range(name) else {
            continue;
        };
        let expected: Vec<f64> = truth.iter().map(|t| t[range.start]).collect();
        let compartment = name
            .strip_prefix("partial_volume_")
            .and_then(|i| i.parse::<usize>().ok());
        match (&volume_fractions, compartment) {
            (Some(vf), Some(i)) => {
                let estimate: Vec<f64> = vf.iter().map(|f| f[i]).collect();
                out.push(recovery(format!("volume_fraction_{i}"), &estimate, &expected));
            }
            _ => out.push(recovery(name.clone(), &fitted.fitted_scalar(name)?, &expected)),
        }
    }
    Ok(out)
}

/// Fraction recovery against Camino ground truth: the voxels simulated at the
/// static diffusivity first, then all voxels.
pub fn camino_recovery(name: &str, estimate: &[f64], data: &CaminoData) -> Vec<Recovery> {
    let (static_estimate, static_truth): (Vec<f64>, Vec<f64>) = estimate
        .iter()
        .zip(&data.fractions)
        .zip(&data.diffusivities)
        .filter(|(_, d)| **d == STATIC_DIFFUSIVITY)
        .map(|((e, f), _)| (*e, *f))
        .unzip();
    vec![
        recovery(format!("{name} (D = {STATIC_DIFFUSIVITY:e})"), &static_estimate, &static_truth),
        recovery(format!("{name} (all D)"), estimate, &data.fractions),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::{SyntheticConfig, generate};
    use crate::models::Compartment;

    #[test]
    fn missing_scheme_is_an_input_error() {
        let args = SchemeArgs {
            preset: None,
            bvals: None,
            bvecs: None,
            delta: None,
            big_delta: None,
            echo_time: None,
        };
        assert_eq!(load_scheme(&args).unwrap_err().exit_code(), 2);
    }

    #[test]
    fn recovery_covers_free_scalars() {
        let scheme = hcp_like().unwrap();
        let mut model = MultiCompartmentModel::new(vec![Compartment::stick(), Compartment::Ball]).unwrap();
        model.set_fixed_parameter("G1Ball_1_lambda_iso", vec![3e-9]).unwrap();
        let config = SyntheticConfig {
            voxels: 4,
            ..SyntheticConfig::default()
        };
        let data = generate(&model, &scheme, &config).unwrap();
        let run = run_fit(&model, &scheme, &data.signal, &FitConfig::default()).unwrap();

        let rows = truth_recovery(&model, &run.fitted, &data.truth).unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["C1Stick_1_lambda_par", "partial_volume_0", "partial_volume_1"]);
        assert!(rows.iter().all(|r| r.n == 4));
        assert!(run.r2.iter().all(|r| *r > 0.99));
    }

    #[test]
    fn multi_tissue_recovery_compares_volume_fractions() {
        let scheme = hcp_like().unwrap();
        let mut model = MultiCompartmentModel::new(vec![Compartment::stick(), Compartment::Ball]).unwrap();
        model.set_fixed_parameter("C1Stick_1_lambda_par", vec![1.7e-9]).unwrap();
        model.set_fixed_parameter("G1Ball_1_lambda_iso", vec![3e-9]).unwrap();
        model.set_s0_responses(vec![1.0, 3.0]).unwrap();
        let config = SyntheticConfig {
            voxels: 4,
            ..SyntheticConfig::default()
        };
        let data = generate(&model, &scheme, &config).unwrap();
        let run = run_fit(&model, &scheme, &data.signal, &FitConfig::default()).unwrap();

        let rows = truth_recovery(&model, &run.fitted, &data.truth).unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["volume_fraction_0", "volume_fraction_1"]);
        assert!(rows.iter().all(|r| r.rmse < 1e-2), "{rows:?}");

        let summaries = crate::report::stats::summarize_parameters(&run.fitted).unwrap();
        assert!(summaries.iter().any(|s| s.name == "volume_fraction_1" && s.n == 4));
    }

    #[test]
    fn camino_recovery_splits_static_diffusivity() {
        let data = CaminoData {
            signal: SignalMatrix::from_rows(vec![vec![1.0]; 4]).unwrap(),
            fractions: vec![0.2, 0.4, 0.6, 0.8],
            diffusivities: vec![1.7e-9, 1.7e-9, 2.0e-9, 2.3e-9],
        };
        let rows = camino_recovery("vf", &[0.2, 0.4, 0.9, 0.8], &data);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].n, 2);
        assert_eq!(rows[0].rmse, 0.0);
        assert!(rows[0].name.starts_with("vf (D = 1.7e-9"));
        assert_eq!(rows[1].n, 4);
        assert!((rows[1].bias - 0.075).abs() < 1e-12);
    }
}
