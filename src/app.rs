//! Top-level application orchestration.
//!
//! `src/main.rs` stays tiny; this module is the "real main" that:
//! - parses CLI arguments and installs the log subscriber
//! - loads schemes, model files and signals
//! - runs simulation or fitting
//! - prints reports/plots
//! - writes optional exports

use clap::Parser;
use tracing::info;

use crate::cli::{CaminoArgs, Cli, Command, FitArgs, OutputArgs, SchemeCommandArgs, SimulateArgs, SolverArgs};
use crate::data::camino::{load_dispersed, load_parallel};
use crate::data::synthetic::{SyntheticConfig, generate};
use crate::domain::FitConfig;
use crate::error::AppError;
use crate::io::{ResultsFile, read_matrix, read_signal_matrix, write_fsl_scheme, write_matrix, write_results_csv,
    write_results_json, write_signal_matrix};
use crate::report::stats::summarize_parameters;

pub mod pipeline;

use pipeline::{FitRun, camino_recovery, load_model, load_scheme, run_fit, truth_recovery};

/// Entry point for the `dmi` binary.
pub fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    crate::logging::init_cli_logger(cli.verbose);

    match cli.command {
        Command::Scheme(args) => handle_scheme(args),
        Command::Simulate(args) => handle_simulate(args),
        Command::Fit(args) => handle_fit(args),
        Command::Camino(args) => handle_camino(args),
    }
}

fn handle_scheme(args: SchemeCommandArgs) -> Result<(), AppError> {
    let scheme = load_scheme(&args.scheme)?;
    println!("{}", scheme.summary());
    if let (Some(bvals), Some(bvecs)) = (&args.out_bvals, &args.out_bvecs) {
        write_fsl_scheme(&scheme, bvals, bvecs)?;
        info!(bvals = %bvals.display(), bvecs = %bvecs.display(), "wrote FSL scheme");
    }
    Ok(())
}

fn handle_simulate(args: SimulateArgs) -> Result<(), AppError> {
    let scheme = load_scheme(&args.scheme)?;
    let loaded = load_model(&args.model)?;
    let config = simulate_config_from_args(&args);
    let data = generate(&loaded.model, &scheme, &config)?;

    write_signal_matrix(
        &args.out_signal,
        &data.signal,
        Some(&format!("{} voxels x {} measurements", data.signal.n_voxels(), data.signal.n_measurements())),
    )?;
    if let Some(path) = &args.out_truth {
        let header = format!("columns: {}", truth_columns(&loaded.model).join(" "));
        write_matrix(path, data.truth.iter().map(Vec::as_slice), Some(&header))?;
    }
    println!(
        "Simulated {} voxels ({} measurements){}",
        data.signal.n_voxels(),
        data.signal.n_measurements(),
        config.snr.map(|s| format!(" at SNR {s}")).unwrap_or_default()
    );
    Ok(())
}

fn truth_columns(model: &crate::models::MultiCompartmentModel) -> Vec<String> {
    model
        .parameters()
        .iter()
        .flat_map(|p| {
            if p.cardinality == 1 {
                vec![p.name.clone()]
            } else {
                (0..p.cardinality).map(|k| format!("{}[{k}]", p.name)).collect()
            }
        })
        .collect()
}

fn handle_fit(args: FitArgs) -> Result<(), AppError> {
    let scheme = load_scheme(&args.scheme)?;
    let loaded = load_model(&args.model)?;
    let config = fit_config_from_args(&args.solver, &loaded.file.solver);
    let data = read_signal_matrix(&args.signal)?;

    let run = run_fit(&loaded.model, &scheme, &data, &config)?;
    print_fit(&run, &scheme)?;

    if let Some(path) = &args.truth {
        let truth = read_matrix(path)?;
        let rows = truth_recovery(&loaded.model, &run.fitted, &truth)?;
        println!("Recovery vs ground truth:");
        println!("{}", crate::report::format_recovery_table(&rows));

        if args.output.plot {
            let range = loaded.model.parameter_range(&args.plot_parameter)?;
            let expected: Vec<f64> = truth.iter().map(|t| t[range.start]).collect();
            let estimate = run.fitted.fitted_scalar(&args.plot_parameter)?;
            let plot = crate::plot::render_scatter(
                &expected,
                &estimate,
                args.output.width,
                args.output.height,
                &args.plot_parameter,
            );
            println!("{plot}");
        }
    }

    export(&run, &args.output)
}

fn handle_camino(args: CaminoArgs) -> Result<(), AppError> {
    let scheme = load_scheme(&args.scheme)?;
    let loaded = load_model(&args.model)?;
    let config = fit_config_from_args(&args.solver, &loaded.file.solver);

    let data = if args.dispersed {
        load_dispersed(&args.dir)?
    } else {
        load_parallel(&args.dir)?
    };

    let run = run_fit(&loaded.model, &scheme, &data.signal, &config)?;
    print_fit(&run, &scheme)?;

    let estimate = run.fitted.fitted_scalar(&args.fraction_parameter)?;
    let rows = camino_recovery(&args.fraction_parameter, &estimate, &data);
    println!("Intra-axonal fraction vs Camino ground truth:");
    println!("{}", crate::report::format_recovery_table(&rows));

    if args.output.plot {
        let plot = crate::plot::render_scatter(
            &data.fractions,
            &estimate,
            args.output.width,
            args.output.height,
            &args.fraction_parameter,
        );
        println!("{plot}");
    }

    export(&run, &args.output)
}

fn print_fit(run: &FitRun, scheme: &crate::acquisition::AcquisitionScheme) -> Result<(), AppError> {
    print!("{}", crate::report::format_run_summary(&run.fitted, scheme, run.elapsed_secs));
    let summaries = summarize_parameters(&run.fitted)?;
    println!("{}", crate::report::format_parameter_table(&summaries));
    Ok(())
}

fn export(run: &FitRun, output: &OutputArgs) -> Result<(), AppError> {
    if output.export_json.is_none() && output.export_csv.is_none() {
        return Ok(());
    }
    let results = ResultsFile::from_fit(&run.fitted, Some(&run.mse), Some(&run.r2));
    if let Some(path) = &output.export_json {
        write_results_json(path, &results)?;
    }
    if let Some(path) = &output.export_csv {
        write_results_csv(path, &results)?;
    }
    Ok(())
}

/// Model-file solver settings with CLI overrides applied.
pub fn fit_config_from_args(args: &SolverArgs, base: &FitConfig) -> FitConfig {
    let mut config = base.clone();
    if let Some(solver) = args.solver {
        config.solver = solver;
    }
    if let Some(threads) = args.threads {
        config.threads = Some(threads);
    }
    if let Some(seed) = args.seed {
        config.mix.seed = seed;
    }
    if let Some(points) = args.grid_points {
        config.brute.grid_points = points;
    }
    if let Some(order) = args.sh_order {
        config.csd.sh_order = order;
    }
    config
}

pub fn simulate_config_from_args(args: &SimulateArgs) -> SyntheticConfig {
    SyntheticConfig {
        voxels: args.voxels,
        s0: args.s0,
        snr: args.snr,
        seed: args.seed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SolverKind;

    #[test]
    fn cli_overrides_model_file_solver() {
        let mut base = FitConfig::default();
        base.mix.generations = 11;
        let args = SolverArgs {
            solver: Some(SolverKind::Mix),
            threads: None,
            seed: Some(5),
            grid_points: None,
            sh_order: Some(6),
        };
        let config = fit_config_from_args(&args, &base);
        assert_eq!(config.solver, SolverKind::Mix);
        assert_eq!(config.mix.seed, 5);
        assert_eq!(config.mix.generations, 11);
        assert_eq!(config.csd.sh_order, 6);
        assert_eq!(config.threads, None);
    }

    #[test]
    fn truth_columns_split_orientations() {
        let model = crate::models::MultiCompartmentModel::new(vec![
            crate::models::Compartment::stick(),
            crate::models::Compartment::Ball,
        ])
        .unwrap();
        let cols = truth_columns(&model);
        assert_eq!(cols[0], "C1Stick_1_mu[0]");
        assert_eq!(cols.len(), model.full_len());
    }
}
