//! Built-in acquisition schemes for simulations and demos.

use nalgebra::{Rotation3, Vector3};

use crate::acquisition::scheme::{AcquisitionScheme, B0_THRESHOLD, PulseTiming};
use crate::error::AppError;
use crate::math::sphere::fibonacci_hemisphere;

/// Pulse duration δ of the WU-Minn HCP protocol (s).
pub const HCP_DELTA: f64 = 0.0106;
/// Pulse separation Δ of the WU-Minn HCP protocol (s).
pub const HCP_BIG_DELTA: f64 = 0.0431;
/// Echo time of the WU-Minn HCP protocol (s).
pub const HCP_ECHO_TIME: f64 = 0.0895;

/// Three-shell protocol modelled after the WU-Minn HCP acquisition:
/// 18 b0 measurements and 90 directions at each of b = 1000, 2000 and
/// 3000 s/mm².
pub fn hcp_like() -> Result<AcquisitionScheme, AppError> {
    multi_shell(
        &[1000.0, 2000.0, 3000.0],
        90,
        18,
        Some(HCP_DELTA),
        Some(HCP_BIG_DELTA),
        Some(HCP_ECHO_TIME),
    )
}

/// Generic multi-shell scheme. `bvalues_smm2` are in s/mm².
///
/// Each shell uses a differently rotated Fibonacci hemisphere so shells
/// interleave rather than repeat the same directions.
pub fn multi_shell(
    bvalues_smm2: &[f64],
    directions_per_shell: usize,
    n_b0: usize,
    delta: Option<f64>,
    big_delta: Option<f64>,
    echo_time: Option<f64>,
) -> Result<AcquisitionScheme, AppError> {
    if bvalues_smm2.is_empty() || directions_per_shell == 0 {
        return Err(AppError::input("A multi-shell scheme needs at least one shell and one direction."));
    }

    let mut bvalues = vec![0.0; n_b0];
    let mut directions = vec![[0.0, 0.0, 0.0]; n_b0];

    let base = fibonacci_hemisphere(directions_per_shell);
    for (k, &b) in bvalues_smm2.iter().enumerate() {
        let rotation = Rotation3::from_axis_angle(&Vector3::z_axis(), 0.61 * k as f64);
        for d in &base {
            let r = rotation * *d;
            bvalues.push(b * 1e6);
            directions.push([r.x, r.y, r.z]);
        }
    }

    let n = bvalues.len();
    let timing = PulseTiming::uniform(n, delta, big_delta, echo_time);
    AcquisitionScheme::from_bvalues(bvalues, directions, timing, B0_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hcp_like_layout() {
        let scheme = hcp_like().unwrap();
        assert_eq!(scheme.n_measurements(), 18 + 3 * 90);
        assert_eq!(scheme.b0_indices().len(), 18);
        assert_eq!(scheme.dwi_shells().count(), 3);
        assert!(scheme.qvalues().is_some());
    }
}
