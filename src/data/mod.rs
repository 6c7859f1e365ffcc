//! Example and synthetic data.
//!
//! - `synthetic`: random model parameters, simulated signals and Rician noise
//! - `camino`: loaders for the Camino Monte-Carlo benchmark text files

pub mod camino;
pub mod synthetic;
