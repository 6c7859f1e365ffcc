//! FSL `bval`/`bvec` acquisition files.
//!
//! `bval` holds b-values in s/mm² (any layout, read in order); `bvec` holds
//! unit gradient directions either as 3 rows × N columns (FSL) or N rows × 3
//! columns. Both are converted to the SI scheme representation.

use std::path::Path;

use tracing::debug;

use crate::acquisition::{AcquisitionScheme, B0_THRESHOLD, PulseTiming};
use crate::error::AppError;
use crate::io::matrix::{read_matrix, rectangular, write_matrix};

/// s/mm² → s/m².
pub const BVALUE_SCALE: f64 = 1e6;

/// Scalar pulse timings applied to every measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimingArgs {
    pub delta: Option<f64>,
    pub big_delta: Option<f64>,
    pub echo_time: Option<f64>,
}

/// Flatten a b-value matrix (row or column vector) into s/m².
pub fn bvalues_from_rows(rows: Vec<Vec<f64>>) -> Vec<f64> {
    rows.into_iter().flatten().map(|b| b * BVALUE_SCALE).collect()
}

/// Directions from either bvec layout. `n` disambiguates the 3×3 case in
/// favour of the FSL layout.
pub fn directions_from_rows(rows: Vec<Vec<f64>>, n: usize, label: &str) -> Result<Vec<[f64; 3]>, AppError> {
    let rows = rectangular(rows, label)?;
    let (r, c) = (rows.len(), rows[0].len());
    if r == 3 && c == n {
        Ok((0..n).map(|j| [rows[0][j], rows[1][j], rows[2][j]]).collect())
    } else if c == 3 && r == n {
        Ok(rows.into_iter().map(|v| [v[0], v[1], v[2]]).collect())
    } else {
        Err(AppError::input(format!(
            "{label} is {r}x{c}; expected 3x{n} or {n}x3 to match the b-values."
        )))
    }
}

pub fn read_fsl_scheme(bvals: &Path, bvecs: &Path, timing: TimingArgs) -> Result<AcquisitionScheme, AppError> {
    let bvalues = bvalues_from_rows(read_matrix(bvals)?);
    if bvalues.is_empty() {
        return Err(AppError::data(format!("'{}' contains no b-values.", bvals.display())));
    }
    let directions = directions_from_rows(read_matrix(bvecs)?, bvalues.len(), &bvecs.display().to_string())?;
    debug!(measurements = bvalues.len(), "read FSL gradient table");

    let timing = PulseTiming::uniform(bvalues.len(), timing.delta, timing.big_delta, timing.echo_time);
    AcquisitionScheme::from_bvalues(bvalues, directions, timing, B0_THRESHOLD)
}

/// Write the scheme as FSL `bval` (one row, s/mm²) and `bvec` (3×N).
pub fn write_fsl_scheme(scheme: &AcquisitionScheme, bvals: &Path, bvecs: &Path) -> Result<(), AppError> {
    let b: Vec<f64> = scheme.bvalues().iter().map(|b| (b / BVALUE_SCALE).round()).collect();
    write_matrix(bvals, [b.as_slice()], None)?;

    let axes: Vec<Vec<f64>> = (0..3)
        .map(|k| scheme.directions().iter().map(|d| d[k]).collect())
        .collect();
    write_matrix(bvecs, axes.iter().map(Vec::as_slice), None)
}
