//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - parameter metadata (`ParameterInfo`, `ParameterKind`)
//! - model/solver configuration enums (`KernelKind`, `DistributionKind`, `SolverKind`)
//! - fit configuration (`FitConfig` and per-solver options)
//! - the voxel signal container (`SignalMatrix`)

pub mod types;

pub use types::*;
