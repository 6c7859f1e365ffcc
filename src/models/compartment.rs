//! Single compartments of a multi-compartment model.

use crate::acquisition::{AcquisitionScheme, Shell};
use crate::domain::{DistributionKind, KernelKind, ParameterInfo, Representation};
use crate::error::AppError;
use crate::math::sphere::angles_to_unitvector;
use crate::models::distributed::{DEFAULT_QUADRATURE_POINTS, DistributedBundle};
use crate::models::kernel::{DIFFUSIVITY_BOUNDS, DIFFUSIVITY_SCALE};

#[derive(Debug, Clone, PartialEq)]
pub enum Compartment {
    /// `G1Ball`: isotropic Gaussian diffusion.
    Ball,
    /// An axially symmetric kernel with a single orientation `mu`.
    Oriented(KernelKind),
    /// Kernels dispersed by a Watson or Bingham distribution.
    Distributed(DistributedBundle),
}

impl Compartment {
    pub fn stick() -> Self {
        Compartment::Oriented(KernelKind::Stick)
    }

    pub fn zeppelin() -> Self {
        Compartment::Oriented(KernelKind::Zeppelin)
    }

    pub fn cylinder() -> Self {
        Compartment::Oriented(KernelKind::Cylinder)
    }

    pub fn watson(kernels: Vec<KernelKind>) -> Result<Self, AppError> {
        DistributedBundle::new(DistributionKind::Watson, kernels, DEFAULT_QUADRATURE_POINTS)
            .map(Compartment::Distributed)
    }

    pub fn bingham(kernels: Vec<KernelKind>) -> Result<Self, AppError> {
        DistributedBundle::new(DistributionKind::Bingham, kernels, DEFAULT_QUADRATURE_POINTS)
            .map(Compartment::Distributed)
    }

    pub fn model_name(&self) -> &'static str {
        match self {
            Compartment::Ball => "G1Ball",
            Compartment::Oriented(kernel) => kernel.model_name(),
            Compartment::Distributed(bundle) => bundle.model_name(),
        }
    }

    pub fn is_isotropic(&self) -> bool {
        matches!(self, Compartment::Ball)
    }

    pub fn requires_qvalues(&self) -> bool {
        match self {
            Compartment::Ball => false,
            Compartment::Oriented(kernel) => kernel.requires_qvalues(),
            Compartment::Distributed(bundle) => bundle.requires_qvalues(),
        }
    }

    /// Parameters in the given representation. Spherical means do not depend
    /// on orientation, so orientation and dispersion parameters are dropped.
    pub fn parameters(&self, representation: Representation) -> Vec<ParameterInfo> {
        match (self, representation) {
            (Compartment::Ball, _) => vec![ParameterInfo::scalar(
                "lambda_iso",
                DIFFUSIVITY_BOUNDS.0,
                DIFFUSIVITY_BOUNDS.1,
                DIFFUSIVITY_SCALE,
            )],
            (Compartment::Oriented(kernel), Representation::Full) => {
                let mut out = vec![ParameterInfo::orientation("mu")];
                out.extend(kernel.parameters());
                out
            }
            (Compartment::Oriented(kernel), Representation::SphericalMean) => kernel.parameters(),
            (Compartment::Distributed(bundle), Representation::Full) => bundle.parameters(),
            (Compartment::Distributed(bundle), Representation::SphericalMean) => bundle.kernel_parameters(),
        }
    }

    pub fn parameter_len(&self, representation: Representation) -> usize {
        self.parameters(representation).iter().map(|p| p.cardinality).sum()
    }

    /// Attenuation for every measurement (full representation parameters).
    pub fn simulate(&self, scheme: &AcquisitionScheme, p: &[f64]) -> Vec<f64> {
        match self {
            Compartment::Ball => scheme.bvalues().iter().map(|&b| (-b * p[0]).exp()).collect(),
            Compartment::Oriented(kernel) => {
                let mu = angles_to_unitvector(p[0], p[1]);
                let kp = &p[2..];
                scheme
                    .directions()
                    .iter()
                    .enumerate()
                    .map(|(i, g)| kernel.attenuation(scheme.measurement(i), g.dot(&mu), kp))
                    .collect()
            }
            Compartment::Distributed(bundle) => bundle.simulate(scheme, p),
        }
    }

    /// Orientation-averaged attenuation on one shell (spherical-mean
    /// representation parameters).
    pub fn spherical_mean(&self, shell: &Shell, p: &[f64]) -> f64 {
        match self {
            Compartment::Ball => (-shell.bvalue * p[0]).exp(),
            Compartment::Oriented(kernel) => kernel.spherical_mean(shell.measurement(), p),
            Compartment::Distributed(bundle) => bundle.spherical_mean(shell, p),
        }
    }

    /// One spherical-mean value per shell of the scheme.
    pub fn simulate_spherical_mean(&self, scheme: &AcquisitionScheme, p: &[f64]) -> Vec<f64> {
        scheme.shells().iter().map(|s| self.spherical_mean(s, p)).collect()
    }

    /// Representation-aware signal: per measurement or per shell.
    /// Project a parameter slice onto the feasible set of the compartment.
    pub fn constrain(&self, p: &mut [f64], representation: Representation) {
        if let Compartment::Distributed(bundle) = self {
            bundle.constrain(p, representation == Representation::Full);
        }
    }

    pub fn signal(&self, scheme: &AcquisitionScheme, p: &[f64], representation: Representation) -> Vec<f64> {
        match representation {
            Representation::Full => self.simulate(scheme, p),
            Representation::SphericalMean => self.simulate_spherical_mean(scheme, p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::presets::hcp_like;

    #[test]
    fn ball_is_mono_exponential() {
        let scheme = hcp_like().unwrap();
        let signal = Compartment::Ball.simulate(&scheme, &[3e-9]);
        for (s, &b) in signal.iter().zip(scheme.bvalues()) {
            assert!((s - (-b * 3e-9).exp()).abs() < 1e-14);
        }
    }

    #[test]
    fn spherical_mean_drops_orientation() {
        let names: Vec<String> = Compartment::stick()
            .parameters(Representation::SphericalMean)
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["lambda_par"]);
        let watson = Compartment::watson(vec![KernelKind::Stick]).unwrap();
        assert_eq!(watson.parameter_len(Representation::Full), 4);
        assert_eq!(watson.parameter_len(Representation::SphericalMean), 1);
    }

    #[test]
    fn stick_signal_along_axis() {
        let scheme = hcp_like().unwrap();
        // mu along z
        let signal = Compartment::stick().simulate(&scheme, &[0.0, 0.0, 1.7e-9]);
        for (i, g) in scheme.directions().iter().enumerate() {
            let expected = (-scheme.bvalues()[i] * 1.7e-9 * g.z * g.z).exp();
            assert!((signal[i] - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn stick_shell_average_matches_spherical_mean() {
        let scheme = hcp_like().unwrap();
        let signal = Compartment::stick().simulate(&scheme, &[0.7, -1.2, 2.0e-9]);
        for shell in scheme.dwi_shells() {
            let mean = shell.measurements.iter().map(|&i| signal[i]).sum::<f64>()
                / shell.measurements.len() as f64;
            let sm = Compartment::stick().spherical_mean(shell, &[2.0e-9]);
            assert!((mean - sm).abs() < 0.02, "shell {}: {mean} vs {sm}", shell.index);
        }
    }
}
