//! Reporting utilities: statistics over fitted voxels and formatted output.

pub mod format;
pub mod stats;

pub use format::*;
pub use stats::*;
