//! Axially symmetric signal kernels.
//!
//! A kernel gives the attenuation of a single fiber population as a function
//! of `t = cos(angle)` between the gradient and the fiber axis. The same
//! kernel evaluation serves three purposes:
//!
//! - oriented compartments (`C1Stick`, `G2Zeppelin`, cylinder) evaluate it at
//!   `t = g·mu`
//! - dispersed bundles integrate it against an orientation distribution
//! - spherical deconvolution needs its Funk–Hecke eigenvalues
//!
//! Kernel parameter slices exclude the orientation; values are in SI units.

use std::f64::consts::PI;

use crate::acquisition::{Measurement, Shell};
use crate::domain::{KernelKind, ParameterInfo};
use crate::math::legendre::gauss_legendre;
use crate::math::sh::rotational_harmonics;
use crate::math::special::{erf, soderman_perpendicular};

/// Diffusivity bounds (scaled) and scale.
pub const DIFFUSIVITY_BOUNDS: (f64, f64) = (0.1, 3.0);
pub const DIFFUSIVITY_SCALE: f64 = 1e-9;

/// Cylinder diameter bounds (scaled) and scale.
pub const DIAMETER_BOUNDS: (f64, f64) = (0.01, 20.0);
pub const DIAMETER_SCALE: f64 = 1e-6;

/// Gauss–Legendre nodes for numerical spherical means.
const SPHERICAL_MEAN_NODES: usize = 64;

fn diffusivity(name: &str) -> ParameterInfo {
    ParameterInfo::scalar(name, DIFFUSIVITY_BOUNDS.0, DIFFUSIVITY_BOUNDS.1, DIFFUSIVITY_SCALE)
}

impl KernelKind {
    /// Model name used as parameter prefix.
    pub fn model_name(self) -> &'static str {
        match self {
            KernelKind::Stick => "C1Stick",
            KernelKind::Zeppelin => "G2Zeppelin",
            KernelKind::Cylinder => "C2CylinderSodermanApproximation",
        }
    }

    /// Kernel parameters (orientation excluded).
    pub fn parameters(self) -> Vec<ParameterInfo> {
        match self {
            KernelKind::Stick => vec![diffusivity("lambda_par")],
            KernelKind::Zeppelin => vec![diffusivity("lambda_par"), diffusivity("lambda_perp")],
            KernelKind::Cylinder => vec![
                diffusivity("lambda_par"),
                ParameterInfo::scalar("diameter", DIAMETER_BOUNDS.0, DIAMETER_BOUNDS.1, DIAMETER_SCALE),
            ],
        }
    }

    pub fn parameter_len(self) -> usize {
        self.parameters().iter().map(|p| p.cardinality).sum()
    }

    /// Restricted kernels need q-values (and therefore pulse timings).
    pub fn requires_qvalues(self) -> bool {
        matches!(self, KernelKind::Cylinder)
    }

    /// Attenuation at `t = cos(angle between gradient and axis)`.
    pub fn attenuation(self, m: Measurement, t: f64, kp: &[f64]) -> f64 {
        let b = m.bvalue;
        let t2 = (t * t).min(1.0);
        match self {
            KernelKind::Stick => (-b * kp[0] * t2).exp(),
            KernelKind::Zeppelin => {
                let (lpar, lperp) = (kp[0], kp[1]);
                (-b * (lperp + (lpar - lperp) * t2)).exp()
            }
            KernelKind::Cylinder => {
                let parallel = (-b * kp[0] * t2).exp();
                let q = m.qvalue.unwrap_or(0.0);
                let radius = kp[1] / 2.0;
                let x = 2.0 * PI * q * radius * (1.0 - t2).sqrt();
                parallel * soderman_perpendicular(x)
            }
        }
    }

    /// Orientation-averaged attenuation on a shell.
    pub fn spherical_mean(self, m: Measurement, kp: &[f64]) -> f64 {
        match self {
            KernelKind::Stick => stick_spherical_mean(m.bvalue * kp[0]),
            KernelKind::Zeppelin if kp[0] >= kp[1] => {
                (-m.bvalue * kp[1]).exp() * stick_spherical_mean(m.bvalue * (kp[0] - kp[1]))
            }
            _ => {
                // ½ ∫ K(t) dt over [-1, 1]; the kernel is even in t.
                let (nodes, weights) = gauss_legendre(SPHERICAL_MEAN_NODES);
                0.5 * nodes
                    .iter()
                    .zip(&weights)
                    .map(|(&t, &w)| w * self.attenuation(m, t, kp))
                    .sum::<f64>()
            }
        }
    }

    /// Funk–Hecke eigenvalues of this kernel on a shell, one per even order.
    pub fn rotational_harmonics(self, shell: &Shell, kp: &[f64], lmax: usize) -> Vec<f64> {
        let m = shell.measurement();
        rotational_harmonics(|t| self.attenuation(m, t, kp), lmax)
    }
}

/// Spherical mean of a stick with `x = b λ`: `√π erf(√x) / (2√x)`.
fn stick_spherical_mean(x: f64) -> f64 {
    if x < 1e-10 {
        return 1.0 - x / 3.0;
    }
    let sx = x.sqrt();
    PI.sqrt() * erf(sx) / (2.0 * sx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(b: f64) -> Measurement {
        Measurement {
            bvalue: b,
            qvalue: None,
        }
    }

    #[test]
    fn stick_parallel_and_perpendicular_limits() {
        let b = 1e9;
        let lambda = 1.7e-9;
        let along = KernelKind::Stick.attenuation(m(b), 1.0, &[lambda]);
        let across = KernelKind::Stick.attenuation(m(b), 0.0, &[lambda]);
        assert!((along - (-b * lambda).exp()).abs() < 1e-14);
        assert!((across - 1.0).abs() < 1e-14);
    }

    #[test]
    fn zeppelin_reduces_to_stick_with_zero_perpendicular() {
        let kp = [2.0e-9, 0.0];
        for &t in &[0.0, 0.3, 0.9] {
            let z = KernelKind::Zeppelin.attenuation(m(2e9), t, &kp);
            let s = KernelKind::Stick.attenuation(m(2e9), t, &[2.0e-9]);
            assert!((z - s).abs() < 1e-14);
        }
    }

    #[test]
    fn closed_form_spherical_mean_matches_quadrature() {
        let kp = [1.7e-9];
        let closed = KernelKind::Stick.spherical_mean(m(3e9), &kp);
        let (nodes, weights) = gauss_legendre(64);
        let numeric: f64 = 0.5
            * nodes
                .iter()
                .zip(&weights)
                .map(|(&t, &w)| w * KernelKind::Stick.attenuation(m(3e9), t, &kp))
                .sum::<f64>();
        assert!((closed - numeric).abs() < 1e-10);

        let kz = [1.7e-9, 0.5e-9];
        let closed = KernelKind::Zeppelin.spherical_mean(m(3e9), &kz);
        let numeric: f64 = 0.5
            * nodes
                .iter()
                .zip(&weights)
                .map(|(&t, &w)| w * KernelKind::Zeppelin.attenuation(m(3e9), t, &kz))
                .sum::<f64>();
        assert!((closed - numeric).abs() < 1e-10);
    }

    #[test]
    fn cylinder_with_zero_q_behaves_like_stick() {
        let c = KernelKind::Cylinder.attenuation(m(1e9), 0.4, &[1.7e-9, 4e-6]);
        let s = KernelKind::Stick.attenuation(m(1e9), 0.4, &[1.7e-9]);
        assert!((c - s).abs() < 1e-14);
    }

    #[test]
    fn cylinder_restricts_perpendicular_signal() {
        let meas = Measurement {
            bvalue: 3e9,
            qvalue: Some(6e4),
        };
        let e = KernelKind::Cylinder.attenuation(meas, 0.0, &[1.7e-9, 6e-6]);
        assert!(e < 1.0 && e > 0.0);
    }
}
