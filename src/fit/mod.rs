//! Model fitting orchestration.
//!
//! Responsibilities:
//!
//! - map a model's optimized parameters onto a bounded search space
//! - run one of the per-voxel solvers (brute2fine, MIX, CSD)
//! - fit all voxels in parallel and collect a `FittedModel`

pub mod brute;
pub mod csd;
pub mod fitted;
pub mod fitter;
pub mod mix;
pub mod refine;
pub mod space;

pub use csd::{Peak, PeakOptions};
pub use fitted::FittedModel;
pub use fitter::{PreparedSignal, VoxelSolver, fit, prepare_signal, spherical_mean_signal};
