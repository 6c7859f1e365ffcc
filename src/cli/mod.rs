//! Command-line parsing for the `dmi` binary.
//!
//! Argument parsing and command dispatch stay separate from the modelling and
//! fitting code; `app` maps these structs into plain config types.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::domain::SolverKind;

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "dmi", version, about = "Diffusion-MRI microstructure model fitting")]
pub struct Cli {
    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the shell structure of an acquisition scheme.
    Scheme(SchemeCommandArgs),
    /// Simulate signals from a model file with random parameters.
    Simulate(SimulateArgs),
    /// Fit a model file to a voxel signal matrix.
    Fit(FitArgs),
    /// Fit the Camino benchmark data and report fraction correlation.
    Camino(CaminoArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SchemePreset {
    /// Three-shell HCP-like protocol (b = 1000/2000/3000 s/mm², 18 b0).
    Hcp,
}

/// Where the acquisition scheme comes from.
#[derive(Debug, Args, Clone)]
pub struct SchemeArgs {
    /// Built-in scheme.
    #[arg(long, value_enum, conflicts_with_all = ["bvals", "bvecs"])]
    pub preset: Option<SchemePreset>,

    /// FSL b-value file (s/mm²).
    #[arg(long, value_name = "FILE", requires = "bvecs")]
    pub bvals: Option<PathBuf>,

    /// FSL gradient direction file (3xN or Nx3).
    #[arg(long, value_name = "FILE", requires = "bvals")]
    pub bvecs: Option<PathBuf>,

    /// Pulse duration δ in seconds.
    #[arg(long)]
    pub delta: Option<f64>,

    /// Pulse separation Δ in seconds.
    #[arg(long = "big-delta")]
    pub big_delta: Option<f64>,

    /// Echo time in seconds.
    #[arg(long = "te")]
    pub echo_time: Option<f64>,
}

#[derive(Debug, Args)]
pub struct SchemeCommandArgs {
    #[command(flatten)]
    pub scheme: SchemeArgs,

    /// Also write the scheme as FSL files.
    #[arg(long, value_name = "FILE", requires = "out_bvecs")]
    pub out_bvals: Option<PathBuf>,

    #[arg(long, value_name = "FILE", requires = "out_bvals")]
    pub out_bvecs: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub scheme: SchemeArgs,

    /// Model description (TOML).
    #[arg(long, value_name = "TOML")]
    pub model: PathBuf,

    #[arg(long, default_value_t = 100)]
    pub voxels: usize,

    /// Rician noise level relative to S0; noiseless when omitted.
    #[arg(long)]
    pub snr: Option<f64>,

    #[arg(long, default_value_t = 100.0)]
    pub s0: f64,

    #[arg(long, default_value_t = 7)]
    pub seed: u64,

    /// Voxel x measurement signal output.
    #[arg(long, value_name = "FILE")]
    pub out_signal: PathBuf,

    /// Ground-truth parameter vectors, one row per voxel.
    #[arg(long, value_name = "FILE")]
    pub out_truth: Option<PathBuf>,
}

/// Output options shared by `fit` and `camino`.
#[derive(Debug, Args, Clone)]
pub struct OutputArgs {
    /// Export results to JSON.
    #[arg(long, value_name = "JSON")]
    pub export_json: Option<PathBuf>,

    /// Export results to CSV (one row per voxel).
    #[arg(long, value_name = "CSV")]
    pub export_csv: Option<PathBuf>,

    /// Render an ASCII scatter of estimate vs ground truth.
    #[arg(long)]
    pub plot: bool,

    /// Plot width (columns).
    #[arg(long, default_value_t = 60)]
    pub width: usize,

    /// Plot height (rows).
    #[arg(long, default_value_t = 20)]
    pub height: usize,
}

/// Solver overrides on top of the model file's `[solver]` section.
#[derive(Debug, Args, Clone)]
pub struct SolverArgs {
    #[arg(long, value_enum)]
    pub solver: Option<SolverKind>,

    /// Worker threads (default: all cores).
    #[arg(long)]
    pub threads: Option<usize>,

    /// MIX random seed.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Brute-force grid points per scalar parameter.
    #[arg(long)]
    pub grid_points: Option<usize>,

    /// CSD spherical-harmonic order.
    #[arg(long)]
    pub sh_order: Option<usize>,
}

#[derive(Debug, Args)]
pub struct FitArgs {
    #[command(flatten)]
    pub scheme: SchemeArgs,

    #[command(flatten)]
    pub solver: SolverArgs,

    #[command(flatten)]
    pub output: OutputArgs,

    /// Model description (TOML).
    #[arg(long, value_name = "TOML")]
    pub model: PathBuf,

    /// Voxel x measurement signal matrix.
    #[arg(long, value_name = "FILE")]
    pub signal: PathBuf,

    /// Ground-truth parameter vectors (as written by `dmi simulate`).
    #[arg(long, value_name = "FILE")]
    pub truth: Option<PathBuf>,

    /// Parameter shown in the scatter plot.
    #[arg(long, default_value = "partial_volume_0")]
    pub plot_parameter: String,
}

#[derive(Debug, Args)]
pub struct CaminoArgs {
    #[command(flatten)]
    pub scheme: SchemeArgs,

    #[command(flatten)]
    pub solver: SolverArgs,

    #[command(flatten)]
    pub output: OutputArgs,

    /// Directory holding the Camino text files.
    #[arg(long, value_name = "DIR")]
    pub dir: PathBuf,

    /// Model description (TOML).
    #[arg(long, value_name = "TOML")]
    pub model: PathBuf,

    /// Use the dispersed dataset instead of the parallel one.
    #[arg(long)]
    pub dispersed: bool,

    /// Fitted parameter compared with the intra-axonal fraction.
    #[arg(long, default_value = "partial_volume_0")]
    pub fraction_parameter: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn fit_arguments_parse() {
        let cli = Cli::parse_from([
            "dmi", "fit", "--preset", "hcp", "--model", "m.toml", "--signal", "s.txt", "--solver", "mix",
            "--threads", "2", "-v",
        ]);
        assert!(cli.verbose);
        let Command::Fit(args) = cli.command else {
            panic!("expected fit");
        };
        assert_eq!(args.solver.solver, Some(SolverKind::Mix));
        assert_eq!(args.solver.threads, Some(2));
        assert_eq!(args.scheme.preset, Some(SchemePreset::Hcp));
        assert_eq!(args.plot_parameter, "partial_volume_0");
    }

    #[test]
    fn preset_conflicts_with_files() {
        let res = Cli::try_parse_from([
            "dmi", "scheme", "--preset", "hcp", "--bvals", "a", "--bvecs", "b",
        ]);
        assert!(res.is_err());
    }
}
