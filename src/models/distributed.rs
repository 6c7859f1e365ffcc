//! Dispersed fiber bundles.
//!
//! A bundle convolves one or more axially symmetric kernels with an
//! orientation distribution:
//!
//! ```text
//! E(g) = ∫ W(n) Σ_i f_i K_i(g·n) dn
//! ```
//!
//! The integral is evaluated by quadrature over a Fibonacci sphere. The
//! distribution is normalised numerically on the same point set, so the
//! quadrature weights always sum to one and `E(b=0) = 1` holds exactly.
//!
//! Distributions (unnormalised densities):
//! - Watson: `exp(κ (mu·n)²)`
//! - Bingham: `exp(κ (mu·n)² + β (mu₂·n)²)`, `mu₂ ⊥ mu` rotated by `psi`

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;

use crate::acquisition::{AcquisitionScheme, Shell};
use crate::domain::{DistributionKind, KernelKind, ParameterInfo};
use crate::error::AppError;
use crate::math::sphere::{SphereSampling, angles_to_unitvector, fibonacci_sphere, perpendicular_frame};

/// Default number of quadrature points on the sphere.
pub const DEFAULT_QUADRATURE_POINTS: usize = 1_000;

/// Concentration bounds shared by `kappa` and `beta`.
pub const CONCENTRATION_BOUNDS: (f64, f64) = (0.0, 16.0);

/// Weights below this fraction of the largest weight are skipped.
const WEIGHT_CUTOFF: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq)]
pub struct DistributedBundle {
    distribution: DistributionKind,
    kernels: Vec<KernelKind>,
    quadrature: Arc<SphereSampling>,
}

impl DistributedBundle {
    pub fn new(
        distribution: DistributionKind,
        kernels: Vec<KernelKind>,
        quadrature_points: usize,
    ) -> Result<Self, AppError> {
        if kernels.is_empty() {
            return Err(AppError::input("A distributed bundle needs at least one kernel."));
        }
        if quadrature_points < 50 {
            return Err(AppError::input("Distributed bundles need at least 50 quadrature points."));
        }
        Ok(Self {
            distribution,
            kernels,
            quadrature: Arc::new(fibonacci_sphere(quadrature_points)),
        })
    }

    pub fn quadrature_points(&self) -> usize {
        self.quadrature.len()
    }

    pub fn distribution(&self) -> DistributionKind {
        self.distribution
    }

    pub fn kernels(&self) -> &[KernelKind] {
        &self.kernels
    }

    pub fn model_name(&self) -> &'static str {
        match self.distribution {
            DistributionKind::Watson => "SD1WatsonDistributed",
            DistributionKind::Bingham => "SD2BinghamDistributed",
        }
    }

    pub fn requires_qvalues(&self) -> bool {
        self.kernels.iter().any(|k| k.requires_qvalues())
    }

    /// Orientation and concentration parameters.
    pub fn distribution_parameters(&self) -> Vec<ParameterInfo> {
        let (lo, hi) = CONCENTRATION_BOUNDS;
        match self.distribution {
            DistributionKind::Watson => vec![
                ParameterInfo::orientation("mu"),
                ParameterInfo::scalar("kappa", lo, hi, 1.0),
            ],
            DistributionKind::Bingham => vec![
                ParameterInfo::orientation("mu"),
                ParameterInfo::scalar("psi", 0.0, PI, 1.0),
                ParameterInfo::scalar("kappa", lo, hi, 1.0),
                ParameterInfo::scalar("beta", lo, hi, 1.0),
            ],
        }
    }

    pub fn distribution_len(&self) -> usize {
        self.distribution_parameters().iter().map(|p| p.cardinality).sum()
    }

    /// Kernel parameters (`<Kernel>_<k>_<param>`) followed by the internal
    /// `partial_volume_<i>` of every kernel but the last.
    pub fn kernel_parameters(&self) -> Vec<ParameterInfo> {
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        let mut out = Vec::new();
        for kernel in &self.kernels {
            let count = counts.entry(kernel.model_name()).or_insert(0);
            *count += 1;
            for p in kernel.parameters() {
                out.push(p.renamed(format!("{}_{}_{}", kernel.model_name(), count, p.name)));
            }
        }
        if self.kernels.len() > 1 {
            for i in 0..self.kernels.len() - 1 {
                out.push(ParameterInfo::fraction(format!("partial_volume_{i}")));
            }
        }
        out
    }

    pub fn parameters(&self) -> Vec<ParameterInfo> {
        let mut out = self.distribution_parameters();
        out.extend(self.kernel_parameters());
        out
    }

    /// Split a kernel-parameter slice into per-kernel slices and fractions.
    fn split_kernel_parameters<'a>(&self, kp: &'a [f64]) -> (Vec<&'a [f64]>, Vec<f64>) {
        let mut slices = Vec::with_capacity(self.kernels.len());
        let mut offset = 0;
        for kernel in &self.kernels {
            let len = kernel.parameter_len();
            slices.push(&kp[offset..offset + len]);
            offset += len;
        }
        let fractions = if self.kernels.len() > 1 {
            let mut f = kp[offset..offset + self.kernels.len() - 1].to_vec();
            simplex_fractions(&mut f);
            let used: f64 = f.iter().sum();
            f.push((1.0 - used).max(0.0));
            f
        } else {
            vec![1.0]
        };
        (slices, fractions)
    }

    /// Put a bundle parameter slice on its feasible set: `beta ≤ kappa` and
    /// internal fractions summing to at most one. `p` starts with the
    /// distribution parameters when `with_distribution`, otherwise it holds
    /// the kernel parameters only.
    pub fn constrain(&self, p: &mut [f64], with_distribution: bool) {
        let dlen = if with_distribution { self.distribution_len() } else { 0 };
        if with_distribution && self.distribution == DistributionKind::Bingham {
            let kappa = p[3].max(0.0);
            p[4] = p[4].clamp(0.0, kappa);
        }
        if self.kernels.len() > 1 {
            let start = dlen + self.kernels.iter().map(|k| k.parameter_len()).sum::<usize>();
            simplex_fractions(&mut p[start..start + self.kernels.len() - 1]);
        }
    }

    /// Normalised quadrature weights of the distribution.
    pub fn distribution_weights(&self, dp: &[f64]) -> Vec<f64> {
        let mu = angles_to_unitvector(dp[0], dp[1]);
        let exponents: Vec<f64> = match self.distribution {
            DistributionKind::Watson => {
                let kappa = dp[2].max(0.0);
                self.quadrature
                    .vertices
                    .iter()
                    .map(|n| kappa * mu.dot(n).powi(2))
                    .collect()
            }
            DistributionKind::Bingham => {
                let psi = dp[2];
                let kappa = dp[3].max(0.0);
                let beta = dp[4].clamp(0.0, kappa);
                let (e1, e2) = perpendicular_frame(dp[0], dp[1]);
                let mu2 = e1 * psi.cos() + e2 * psi.sin();
                self.quadrature
                    .vertices
                    .iter()
                    .map(|n| kappa * mu.dot(n).powi(2) + beta * mu2.dot(n).powi(2))
                    .collect()
            }
        };

        // Shift by the max exponent so large concentrations cannot overflow.
        let max = exponents.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut weights: Vec<f64> = exponents
            .iter()
            .zip(&self.quadrature.weights)
            .map(|(&e, &w)| w * (e - max).exp())
            .collect();
        let total: f64 = weights.iter().sum();
        if total > 0.0 && total.is_finite() {
            for w in &mut weights {
                *w /= total;
            }
        }
        weights
    }

    /// Signal for every measurement; `p` is the full bundle parameter slice.
    pub fn simulate(&self, scheme: &AcquisitionScheme, p: &[f64]) -> Vec<f64> {
        let dlen = self.distribution_len();
        let weights = self.distribution_weights(&p[..dlen]);
        let (slices, fractions) = self.split_kernel_parameters(&p[dlen..]);

        let wmax = weights.iter().copied().fold(0.0, f64::max);
        let active: Vec<usize> = (0..weights.len())
            .filter(|&k| weights[k] > WEIGHT_CUTOFF * wmax)
            .collect();

        let n_meas = scheme.n_measurements();
        let mut out = vec![0.0; n_meas];
        for (i, g) in scheme.directions().iter().enumerate() {
            let m = scheme.measurement(i);
            let mut acc = 0.0;
            for &k in &active {
                let t = g.dot(&self.quadrature.vertices[k]);
                let mut kernel_mix = 0.0;
                for ((kernel, kp), f) in self.kernels.iter().zip(&slices).zip(&fractions) {
                    kernel_mix += f * kernel.attenuation(m, t, kp);
                }
                acc += weights[k] * kernel_mix;
            }
            out[i] = acc;
        }
        out
    }

    /// Orientation-averaged signal; dispersion does not change it, so only the
    /// kernel-parameter slice is needed.
    pub fn spherical_mean(&self, shell: &Shell, kp: &[f64]) -> f64 {
        let (slices, fractions) = self.split_kernel_parameters(kp);
        let m = shell.measurement();
        self.kernels
            .iter()
            .zip(&slices)
            .zip(&fractions)
            .map(|((kernel, kp), f)| f * kernel.spherical_mean(m, kp))
            .sum()
    }
}

/// Clamp to `[0, 1]` and rescale when the sum exceeds one, so the implied
/// last fraction `1 - Σ f` is never negative.
fn simplex_fractions(f: &mut [f64]) {
    for v in f.iter_mut() {
        *v = v.clamp(0.0, 1.0);
    }
    let total: f64 = f.iter().sum();
    if total > 1.0 {
        for v in f.iter_mut() {
            *v /= total;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::presets::hcp_like;

    #[test]
    fn parameter_names_are_prefixed() {
        let b = DistributedBundle::new(
            DistributionKind::Watson,
            vec![KernelKind::Stick, KernelKind::Zeppelin],
            500,
        )
        .unwrap();
        let names: Vec<String> = b.parameters().into_iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec![
                "mu",
                "kappa",
                "C1Stick_1_lambda_par",
                "G2Zeppelin_1_lambda_par",
                "G2Zeppelin_1_lambda_perp",
                "partial_volume_0",
            ]
        );
    }

    #[test]
    fn weights_are_normalised() {
        let b = DistributedBundle::new(DistributionKind::Bingham, vec![KernelKind::Stick], 800).unwrap();
        let w = b.distribution_weights(&[0.4, 1.0, 0.3, 12.0, 4.0]);
        let total: f64 = w.iter().sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn b0_signal_is_one_and_dispersion_lowers_anisotropy() {
        let scheme = hcp_like().unwrap();
        let b = DistributedBundle::new(DistributionKind::Watson, vec![KernelKind::Stick], 2000).unwrap();
        let tight = b.simulate(&scheme, &[0.0, 0.0, 16.0, 1.7e-9]);
        let loose = b.simulate(&scheme, &[0.0, 0.0, 0.5, 1.7e-9]);
        for &i in &scheme.b0_indices() {
            assert!((tight[i] - 1.0).abs() < 1e-12);
        }
        let spread = |s: &[f64]| {
            let dwi = scheme.dwi_indices();
            let max = dwi.iter().map(|&i| s[i]).fold(f64::NEG_INFINITY, f64::max);
            let min = dwi.iter().map(|&i| s[i]).fold(f64::INFINITY, f64::min);
            max - min
        };
        assert!(spread(&tight) > spread(&loose));
    }

    #[test]
    fn spherical_mean_of_bundle_matches_orientation_average() {
        let scheme = hcp_like().unwrap();
        let b = DistributedBundle::new(DistributionKind::Watson, vec![KernelKind::Stick], 2000).unwrap();
        let signal = b.simulate(&scheme, &[0.3, 0.2, 4.0, 1.7e-9]);
        let shell = scheme.dwi_shells().next().unwrap();
        let mean: f64 =
            shell.measurements.iter().map(|&i| signal[i]).sum::<f64>() / shell.measurements.len() as f64;
        let sm = b.spherical_mean(shell, &[1.7e-9]);
        assert!((mean - sm).abs() < 0.02, "mean {mean} vs spherical mean {sm}");
    }

    #[test]
    fn three_kernel_mix_keeps_unit_b0() {
        let scheme = hcp_like().unwrap();
        let b = DistributedBundle::new(
            DistributionKind::Watson,
            vec![KernelKind::Stick, KernelKind::Stick, KernelKind::Zeppelin],
            300,
        )
        .unwrap();
        let mut p = vec![0.2, 0.4, 3.0, 1.7e-9, 2.0e-9, 1.7e-9, 0.5e-9, 0.9, 0.8];
        let raw = b.simulate(&scheme, &p);
        b.constrain(&mut p, true);
        assert!((p[7] + p[8] - 1.0).abs() < 1e-12);
        assert!((p[7] - 0.9 / 1.7).abs() < 1e-12);
        let constrained = b.simulate(&scheme, &p);
        for &i in &scheme.b0_indices() {
            assert!((raw[i] - 1.0).abs() < 1e-12);
            assert!((constrained[i] - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn bingham_beta_is_capped_by_kappa() {
        let b = DistributedBundle::new(DistributionKind::Bingham, vec![KernelKind::Stick], 300).unwrap();
        let mut p = vec![0.4, 1.0, 0.3, 2.0, 9.0, 1.7e-9];
        b.constrain(&mut p, true);
        assert_eq!(p[4], 2.0);
        let mut kernel_only = vec![1.7e-9];
        b.constrain(&mut kernel_only, false);
        assert_eq!(kernel_only, vec![1.7e-9]);
    }
}
