//! Synthetic voxel generation for simulations and recovery tests.
//!
//! Free parameters are drawn inside their optimisation bounds:
//! - scalars uniformly
//! - orientations uniformly on the sphere
//! - partial volumes from a flat Dirichlet over what fixed ones leave
//! - bundle-internal fractions from a flat Dirichlet, Bingham `beta` in `[0, kappa]`
//!
//! Linked parameters follow from their links. With S0 responses the partial
//! volumes are volume fractions and each compartment is weighted by its
//! response, relative to `s0`. Optional Rician noise is added with
//! `σ = S0 / snr`.

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::{Gamma, Normal};

use crate::acquisition::AcquisitionScheme;
use crate::domain::{ParameterKind, SignalMatrix};
use crate::error::AppError;
use crate::math::sphere::unitvector_to_angles;
use crate::models::MultiCompartmentModel;

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticConfig {
    pub voxels: usize,
    /// Non-diffusion-weighted signal level.
    pub s0: f64,
    /// Signal-to-noise ratio of the b0 signal; `None` = noiseless.
    pub snr: Option<f64>,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            voxels: 100,
            s0: 100.0,
            snr: None,
            seed: 7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticData {
    pub signal: SignalMatrix,
    /// Full parameter vector per voxel.
    pub truth: Vec<Vec<f64>>,
    pub parameter_names: Vec<String>,
}

impl SyntheticData {
    /// Ground-truth values of a scalar parameter.
    pub fn truth_of(&self, model: &MultiCompartmentModel, name: &str) -> Result<Vec<f64>, AppError> {
        let range = model.parameter_range(name)?;
        if range.len() != 1 {
            return Err(AppError::input(format!("Parameter '{name}' is not a scalar.")));
        }
        Ok(self.truth.iter().map(|t| t[range.start]).collect())
    }
}

/// Random optimized vector inside the model bounds.
pub fn random_parameters(model: &MultiCompartmentModel, rng: &mut StdRng) -> Result<Vec<f64>, AppError> {
    let normal = Normal::new(0.0, 1.0).map_err(|e| AppError::numeric(format!("Sampling distribution error: {e}")))?;
    let gamma = Gamma::new(1.0, 1.0).map_err(|e| AppError::numeric(format!("Sampling distribution error: {e}")))?;

    let budget = model.free_fraction_budget();
    let mut out = Vec::with_capacity(model.optimized_len());
    let mut volume_slots = Vec::new();
    // Bundle-internal fractions grouped by bundle prefix, in draw order.
    let mut bundle_slots: Vec<(String, Vec<usize>)> = Vec::new();
    // Drawn `kappa` per bundle prefix; caps the matching Bingham `beta`.
    let mut kappas: Vec<(String, f64)> = Vec::new();

    for p in model.optimized_parameters() {
        let is_volume = p.kind == ParameterKind::Fraction && model.is_partial_volume(&p.name);
        match p.kind {
            ParameterKind::Orientation => {
                let v = nalgebra::Vector3::new(normal.sample(rng), normal.sample(rng), normal.sample(rng));
                let v = if v.norm() > 1e-12 { v.normalize() } else { nalgebra::Vector3::z() };
                out.extend(unitvector_to_angles(&v));
            }
            ParameterKind::Fraction if is_volume && budget.is_some() => {
                volume_slots.push(out.len());
                out.push(gamma.sample(rng));
            }
            ParameterKind::Fraction if !is_volume => {
                let prefix = p.name.rsplit_once("partial_volume_").map_or("", |(pre, _)| pre);
                let slot = out.len();
                match bundle_slots.iter_mut().find(|(pre, _)| pre == prefix) {
                    Some((_, slots)) => slots.push(slot),
                    None => bundle_slots.push((prefix.to_string(), vec![slot])),
                }
                out.push(gamma.sample(rng));
            }
            _ => {
                let cap = p
                    .name
                    .strip_suffix("beta")
                    .and_then(|prefix| kappas.iter().find(|(pre, _)| pre == prefix))
                    .map(|(_, kappa)| kappa / p.scale);
                for &(lo, hi) in &p.bounds {
                    let hi = cap.map_or(hi, |c| c.clamp(lo, hi));
                    out.push(rng.gen_range(lo..=hi) * p.scale);
                }
                if let (Some(prefix), Some(&kappa)) = (p.name.strip_suffix("kappa"), out.last()) {
                    kappas.push((prefix.to_string(), kappa));
                }
            }
        }
    }

    if let Some(budget) = budget {
        let total: f64 = volume_slots.iter().map(|&i| out[i]).sum();
        for &i in &volume_slots {
            out[i] *= budget / total;
        }
    }
    // The last kernel's fraction is implied, so draw one extra share.
    for (_, slots) in &bundle_slots {
        let total: f64 = slots.iter().map(|&i| out[i]).sum::<f64>() + gamma.sample(rng);
        for &i in slots {
            out[i] /= total;
        }
    }
    Ok(out)
}

/// `|S + n₁ + i n₂|` with `n₁, n₂ ~ N(0, σ)`.
pub fn add_rician_noise(signal: &mut [f64], sigma: f64, rng: &mut StdRng) -> Result<(), AppError> {
    let normal = Normal::new(0.0, sigma).map_err(|e| AppError::input(format!("Invalid noise level: {e}")))?;
    for s in signal.iter_mut() {
        let re = *s + normal.sample(rng);
        let im = normal.sample(rng);
        *s = (re * re + im * im).sqrt();
    }
    Ok(())
}

pub fn generate(
    model: &MultiCompartmentModel,
    scheme: &AcquisitionScheme,
    config: &SyntheticConfig,
) -> Result<SyntheticData, AppError> {
    if config.voxels == 0 {
        return Err(AppError::input("Voxel count must be > 0."));
    }
    if !(config.s0.is_finite() && config.s0 > 0.0) {
        return Err(AppError::input("S0 must be finite and > 0."));
    }
    if let Some(snr) = config.snr {
        if !(snr.is_finite() && snr > 0.0) {
            return Err(AppError::input("SNR must be finite and > 0."));
        }
    }
    model.check_scheme(scheme)?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut rows = Vec::with_capacity(config.voxels);
    let mut truth = Vec::with_capacity(config.voxels);
    for _ in 0..config.voxels {
        let full = model.expand(&random_parameters(model, &mut rng)?)?;
        let attenuation = match model.s0_responses() {
            Some(_) => model.simulate_multi_tissue_signal(scheme, &full)?,
            None => model.simulate_signal(scheme, &full)?,
        };
        let mut signal: Vec<f64> = attenuation
            .into_iter()
            .map(|e| e * config.s0)
            .collect();
        if let Some(snr) = config.snr {
            add_rician_noise(&mut signal, config.s0 / snr, &mut rng)?;
        }
        rows.push(signal);
        truth.push(full);
    }

    Ok(SyntheticData {
        signal: SignalMatrix::from_rows(rows)?,
        truth,
        parameter_names: model.parameter_names(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::presets::hcp_like;
    use crate::domain::KernelKind;
    use crate::models::Compartment;

    fn stick_ball() -> MultiCompartmentModel {
        MultiCompartmentModel::new(vec![Compartment::stick(), Compartment::Ball]).unwrap()
    }

    #[test]
    fn parameters_respect_bounds_and_simplex() {
        let model = stick_ball();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let p = random_parameters(&model, &mut rng).unwrap();
            assert_eq!(p.len(), model.optimized_len());
            assert!((0.0..=std::f64::consts::PI).contains(&p[0]));
            assert!(p[2] >= 0.099e-9 && p[2] <= 3.001e-9);
            assert!((p[4] + p[5] - 1.0).abs() < 1e-12);
            assert!(p[4] >= 0.0 && p[5] >= 0.0);
        }
    }

    #[test]
    fn same_seed_same_data() {
        let scheme = hcp_like().unwrap();
        let config = SyntheticConfig {
            voxels: 3,
            snr: Some(30.0),
            ..SyntheticConfig::default()
        };
        let a = generate(&stick_ball(), &scheme, &config).unwrap();
        let b = generate(&stick_ball(), &scheme, &config).unwrap();
        assert_eq!(a.signal, b.signal);
        assert_eq!(a.truth, b.truth);
        assert_eq!(a.signal.n_measurements(), scheme.n_measurements());
    }

    #[test]
    fn noiseless_b0_equals_s0() {
        let scheme = hcp_like().unwrap();
        let data = generate(&stick_ball(), &scheme, &SyntheticConfig::default()).unwrap();
        assert!((data.signal.voxel(0)[0] - 100.0).abs() < 1e-9);
        let f = data.truth_of(&stick_ball(), "partial_volume_0").unwrap();
        assert_eq!(f.len(), 100);
    }

    #[test]
    fn simulated_bingham_beta_stays_below_kappa() {
        let scheme = hcp_like().unwrap();
        let model = MultiCompartmentModel::new(vec![
            Compartment::bingham(vec![KernelKind::Stick]).unwrap(),
            Compartment::Ball,
        ])
        .unwrap();
        let config = SyntheticConfig {
            voxels: 50,
            ..SyntheticConfig::default()
        };
        let data = generate(&model, &scheme, &config).unwrap();
        let kappa = data.truth_of(&model, "SD2BinghamDistributed_1_kappa").unwrap();
        let beta = data.truth_of(&model, "SD2BinghamDistributed_1_beta").unwrap();
        for (k, b) in kappa.iter().zip(&beta) {
            assert!(*b >= 0.0 && b <= k, "beta {b} > kappa {k}");
        }
    }

    #[test]
    fn three_kernel_bundle_keeps_b0_at_s0() {
        let scheme = hcp_like().unwrap();
        let bundle = Compartment::watson(vec![KernelKind::Stick, KernelKind::Stick, KernelKind::Zeppelin]).unwrap();
        let model = MultiCompartmentModel::new(vec![bundle]).unwrap();
        let config = SyntheticConfig {
            voxels: 50,
            ..SyntheticConfig::default()
        };
        let data = generate(&model, &scheme, &config).unwrap();
        let f0 = data.truth_of(&model, "SD1WatsonDistributed_1_partial_volume_0").unwrap();
        let f1 = data.truth_of(&model, "SD1WatsonDistributed_1_partial_volume_1").unwrap();
        for v in 0..data.signal.n_voxels() {
            assert!(f0[v] + f1[v] <= 1.0 + 1e-12);
            assert!((data.signal.voxel(v)[0] - 100.0).abs() < 1e-6, "b0 = {}", data.signal.voxel(v)[0]);
        }
    }

    #[test]
    fn fixed_partial_volume_leaves_the_rest_to_the_others() {
        let mut model =
            MultiCompartmentModel::new(vec![Compartment::stick(), Compartment::zeppelin(), Compartment::Ball]).unwrap();
        model.set_fixed_parameter("partial_volume_2", vec![0.2]).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..20 {
            let full = model.expand(&random_parameters(&model, &mut rng).unwrap()).unwrap();
            let fractions = &full[full.len() - 3..];
            assert!((fractions.iter().sum::<f64>() - 1.0).abs() < 1e-12, "{fractions:?}");
            assert_eq!(fractions[2], 0.2);
        }
    }

    #[test]
    fn multi_tissue_signal_scales_by_responses() {
        let scheme = hcp_like().unwrap();
        let mut model = stick_ball();
        model.set_s0_responses(vec![1.0, 2.0]).unwrap();
        let config = SyntheticConfig {
            voxels: 10,
            ..SyntheticConfig::default()
        };
        let data = generate(&model, &scheme, &config).unwrap();
        let vf = data.truth_of(&model, "partial_volume_0").unwrap();
        for (v, f) in vf.iter().enumerate() {
            let expected = 100.0 * (f * 1.0 + (1.0 - f) * 2.0);
            assert!((data.signal.voxel(v)[0] - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn rician_noise_is_positive() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut s = vec![0.0; 100];
        add_rician_noise(&mut s, 1.0, &mut rng).unwrap();
        assert!(s.iter().all(|v| *v >= 0.0));
        assert!(s.iter().any(|v| *v > 0.0));
    }
}
