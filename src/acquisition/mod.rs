//! Acquisition schemes: what was measured, and how measurements group into
//! shells.
//!
//! - `scheme`: the `AcquisitionScheme` type, shell clustering and summaries
//! - `presets`: ready-made multi-shell protocols for simulation

pub mod presets;
pub mod scheme;

pub use scheme::*;
