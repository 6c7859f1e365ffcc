//! `dmi-models` library crate.
//!
//! Multi-compartment diffusion-MRI microstructure models and their fitting.
//! The binary (`dmi`) is a thin wrapper around this library so that:
//!
//! - core logic is testable without spawning processes
//! - models and solvers are reusable from other tools
//! - code stays easy to navigate as the project grows

pub mod acquisition;
pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod logging;
pub mod math;
pub mod models;
pub mod plot;
pub mod report;
