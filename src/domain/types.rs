//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - used in-memory during fitting
//! - read from model TOML files and CLI flags
//! - exported to JSON/CSV

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// What a model parameter represents; drives grids, bounds and sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    /// Ordinary bounded scalar (diffusivity, diameter, concentration).
    Scalar,
    /// Spherical angles `[θ, φ]` of an axis.
    Orientation,
    /// Volume/signal fraction in `[0, 1]`.
    Fraction,
}

/// Metadata for one named parameter.
///
/// `bounds` are in scaled units (one pair per component); the physical value is
/// `scaled × scale`. Diffusivities, for example, are bounded in `[0.1, 3]` with
/// `scale = 1e-9` m²/s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub name: String,
    pub cardinality: usize,
    pub bounds: Vec<(f64, f64)>,
    pub scale: f64,
    pub kind: ParameterKind,
}

impl ParameterInfo {
    pub fn scalar(name: impl Into<String>, lo: f64, hi: f64, scale: f64) -> Self {
        Self {
            name: name.into(),
            cardinality: 1,
            bounds: vec![(lo, hi)],
            scale,
            kind: ParameterKind::Scalar,
        }
    }

    pub fn orientation(name: impl Into<String>) -> Self {
        use std::f64::consts::PI;
        Self {
            name: name.into(),
            cardinality: 2,
            bounds: vec![(0.0, PI), (-PI, PI)],
            scale: 1.0,
            kind: ParameterKind::Orientation,
        }
    }

    pub fn fraction(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cardinality: 1,
            bounds: vec![(0.0, 1.0)],
            scale: 1.0,
            kind: ParameterKind::Fraction,
        }
    }

    /// Copy of this parameter under a different (prefixed) name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Physical bounds (`scaled × scale`) per component.
    pub fn physical_bounds(&self) -> Vec<(f64, f64)> {
        self.bounds
            .iter()
            .map(|&(lo, hi)| (lo * self.scale, hi * self.scale))
            .collect()
    }
}

/// Axially symmetric kernels that can be oriented or dispersed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum KernelKind {
    /// `C1Stick`: zero-radius cylinder.
    Stick,
    /// `G2Zeppelin`: axially symmetric tensor.
    Zeppelin,
    /// `C2CylinderSodermanApproximation`: impermeable cylinder, short pulses.
    Cylinder,
}

/// Orientation distributions for dispersed bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DistributionKind {
    /// `SD1Watson`: axially symmetric dispersion (`kappa`).
    Watson,
    /// `SD2Bingham`: anisotropic dispersion (`psi`, `kappa`, `beta`).
    Bingham,
}

/// Which signal the multi-compartment model describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Representation {
    /// One value per measurement.
    #[default]
    Full,
    /// One value per shell: the orientation-averaged attenuation.
    SphericalMean,
}

/// Optimizer back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    /// Brute-force grid followed by bounded Nelder–Mead refinement.
    #[default]
    #[value(name = "brute2fine")]
    Brute2Fine,
    /// Three-stage stochastic / linear / refinement optimizer.
    Mix,
    /// Constrained spherical deconvolution (SH coefficients of the FOD).
    Csd,
}

impl SolverKind {
    pub fn display_name(self) -> &'static str {
        match self {
            SolverKind::Brute2Fine => "brute2fine",
            SolverKind::Mix => "MIX",
            SolverKind::Csd => "CSD",
        }
    }
}

/// Brute-force + refinement settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BruteForceOptions {
    /// Grid points per scalar/fraction component.
    pub grid_points: usize,
    /// Hemisphere directions per orientation parameter.
    pub orientation_points: usize,
    /// Upper bound on the number of grid candidates per voxel.
    pub max_grid_size: usize,
}

impl Default for BruteForceOptions {
    fn default() -> Self {
        Self {
            grid_points: 5,
            orientation_points: 40,
            max_grid_size: 20_000,
        }
    }
}

/// Nelder–Mead refinement settings (shared by brute2fine and MIX).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineOptions {
    pub max_iters: u64,
    /// Standard-deviation tolerance of the simplex cost values.
    pub tolerance: f64,
}

impl Default for RefineOptions {
    fn default() -> Self {
        Self {
            max_iters: 2_000,
            tolerance: 1e-12,
        }
    }
}

/// Differential-evolution settings for MIX stage 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixOptions {
    /// Population size as a multiple of the search dimension.
    pub population_factor: usize,
    pub generations: usize,
    /// Differential weight `F`.
    pub mutation: f64,
    /// Crossover probability `CR`.
    pub crossover: f64,
    pub seed: u64,
}

impl Default for MixOptions {
    fn default() -> Self {
        Self {
            population_factor: 15,
            generations: 60,
            mutation: 0.7,
            crossover: 0.9,
            seed: 42,
        }
    }
}

/// Constrained spherical deconvolution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsdOptions {
    /// Maximum (even) SH order of the FOD.
    pub sh_order: usize,
    /// Weight of the positivity penalty rows.
    pub lambda: f64,
    /// Amplitude threshold, as a fraction of the mean initial FOD amplitude.
    pub tau: f64,
    /// Hemisphere points on which positivity is enforced.
    pub sphere_points: usize,
    pub max_iters: usize,
    /// Add a heavily weighted `Σ vf = 1` row.
    pub unity_constraint: bool,
}

impl Default for CsdOptions {
    fn default() -> Self {
        Self {
            sh_order: 8,
            lambda: 1.0,
            tau: 0.1,
            sphere_points: 300,
            max_iters: 50,
            unity_constraint: true,
        }
    }
}

/// A full fit configuration as understood by the fitting pipeline.
///
/// Derived from the model file's `[solver]` section plus CLI flags.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub solver: SolverKind,
    /// Worker threads for the voxel map (`None` = rayon default).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,
    pub brute: BruteForceOptions,
    pub refine: RefineOptions,
    pub mix: MixOptions,
    pub csd: CsdOptions,
}

impl FitConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.brute.grid_points == 0 || self.brute.orientation_points == 0 || self.brute.max_grid_size == 0 {
            return Err(AppError::input("Grid sizes must be >= 1."));
        }
        if !(self.refine.tolerance.is_finite() && self.refine.tolerance >= 0.0) {
            return Err(AppError::input("Refinement tolerance must be finite and >= 0."));
        }
        if self.mix.population_factor == 0 || self.mix.generations == 0 {
            return Err(AppError::input("MIX population factor and generations must be >= 1."));
        }
        if !(self.mix.mutation > 0.0 && self.mix.mutation <= 2.0) {
            return Err(AppError::input("MIX mutation must be in (0, 2]."));
        }
        if !(0.0..=1.0).contains(&self.mix.crossover) {
            return Err(AppError::input("MIX crossover must be in [0, 1]."));
        }
        if self.csd.sh_order < 2 || self.csd.sh_order % 2 != 0 {
            return Err(AppError::input("CSD sh_order must be even and >= 2."));
        }
        if !(self.csd.lambda.is_finite() && self.csd.lambda > 0.0) {
            return Err(AppError::input("CSD lambda must be > 0."));
        }
        if self.threads == Some(0) {
            return Err(AppError::input("Thread count must be >= 1."));
        }
        Ok(())
    }
}

/// Row-major voxel × measurement matrix of signal values.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMatrix {
    n_measurements: usize,
    values: Vec<f64>,
}

impl SignalMatrix {
    pub fn new(n_measurements: usize, values: Vec<f64>) -> Result<Self, AppError> {
        if n_measurements == 0 {
            return Err(AppError::input("Signal matrix must have at least one measurement."));
        }
        if values.len() % n_measurements != 0 {
            return Err(AppError::input(format!(
                "Signal length {} is not a multiple of {n_measurements} measurements.",
                values.len()
            )));
        }
        Ok(Self {
            n_measurements,
            values,
        })
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, AppError> {
        let Some(first) = rows.first() else {
            return Err(AppError::data("Signal matrix has no voxels."));
        };
        let n = first.len();
        if rows.iter().any(|r| r.len() != n) {
            return Err(AppError::input("All voxels must have the same number of measurements."));
        }
        Self::new(n, rows.into_iter().flatten().collect())
    }

    pub fn n_voxels(&self) -> usize {
        self.values.len() / self.n_measurements
    }

    pub fn n_measurements(&self) -> usize {
        self.n_measurements
    }

    pub fn voxel(&self, i: usize) -> &[f64] {
        let start = i * self.n_measurements;
        &self.values[start..start + self.n_measurements]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.values.chunks(self.n_measurements)
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}
