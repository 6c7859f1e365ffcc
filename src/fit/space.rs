//! Search space shared by the optimizers.
//!
//! Solvers search in *scaled* units (diffusivities in µm²/ms, diameters in
//! µm, angles in radians) inside a box. The `n` free partial volumes are
//! replaced by `n - 1` nested fractions `f_0 = B x_0, f_1 = (B - f_0) x_1, ...`
//! so any point of the box maps onto the simplex of total `B`. `B` is one when
//! every partial volume is free and `1 - Σ fixed` when some are fixed.

use crate::domain::{ParameterInfo, ParameterKind};
use crate::error::AppError;
use crate::models::MultiCompartmentModel;

/// How partial volumes enter the search vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FractionHandling {
    /// Nested reparametrisation on the residual simplex; box fractions when a
    /// partial volume follows a non-fixed link.
    Nested,
    /// Fractions are left out; the caller supplies them.
    Excluded,
}

#[derive(Debug, Clone, PartialEq)]
struct Component {
    /// Position in the optimized vector.
    position: usize,
    lo: f64,
    hi: f64,
    scale: f64,
    kind: ParameterKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchSpace {
    components: Vec<Component>,
    /// Optimized-vector positions of nested (or excluded) fractions.
    fraction_positions: Vec<usize>,
    nested: bool,
    /// Total of the nested fractions.
    budget: f64,
    optimized_len: usize,
}

impl SearchSpace {
    pub fn new(model: &MultiCompartmentModel, handling: FractionHandling) -> Result<Self, AppError> {
        let optimized = model.optimized_parameters();
        let is_volume = |p: &ParameterInfo| p.kind == ParameterKind::Fraction && model.is_partial_volume(&p.name);
        let free_fractions = optimized.iter().filter(|p| is_volume(**p)).count();
        let all_fractions_free = model.n_compartments() > 1 && free_fractions == model.n_compartments();
        let budget = model.free_fraction_budget();

        let mut components = Vec::new();
        let mut fraction_positions = Vec::new();
        let mut position = 0;
        for p in &optimized {
            for &(lo, hi) in &p.bounds {
                let separate = is_volume(*p) && (handling == FractionHandling::Excluded || budget.is_some());
                if separate {
                    fraction_positions.push(position);
                } else {
                    components.push(Component {
                        position,
                        lo,
                        hi,
                        scale: p.scale,
                        kind: p.kind,
                    });
                }
                position += 1;
            }
        }

        if handling == FractionHandling::Excluded && !fraction_positions.is_empty() && !all_fractions_free {
            return Err(AppError::input(
                "Fractions can only be solved separately when every partial volume is free.",
            ));
        }

        Ok(Self {
            components,
            fraction_positions,
            nested: handling == FractionHandling::Nested && budget.is_some(),
            budget: budget.unwrap_or(1.0),
            optimized_len: position,
        })
    }

    /// Search dimension.
    pub fn dim(&self) -> usize {
        self.components.len() + self.nested_len()
    }

    fn nested_len(&self) -> usize {
        if self.nested {
            self.fraction_positions.len() - 1
        } else {
            0
        }
    }

    /// Number of fractions the caller supplies in excluded mode.
    pub fn excluded_fractions(&self) -> usize {
        if self.nested { 0 } else { self.fraction_positions.len() }
    }

    /// Box bounds per search dimension.
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        let mut out: Vec<(f64, f64)> = self.components.iter().map(|c| (c.lo, c.hi)).collect();
        out.extend(std::iter::repeat_n((0.0, 1.0), self.nested_len()));
        out
    }

    /// Kind per search dimension (nested fractions report `Fraction`).
    pub fn kinds(&self) -> Vec<ParameterKind> {
        let mut out: Vec<ParameterKind> = self.components.iter().map(|c| c.kind).collect();
        out.extend(std::iter::repeat_n(ParameterKind::Fraction, self.nested_len()));
        out
    }

    pub fn clamp(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(self.bounds())
            .map(|(&v, (lo, hi))| if v.is_finite() { v.clamp(lo, hi) } else { lo })
            .collect()
    }

    /// Squared distance of `x` outside the box.
    pub fn excess(&self, x: &[f64]) -> f64 {
        x.iter()
            .zip(self.bounds())
            .map(|(&v, (lo, hi))| {
                let d = if v < lo { lo - v } else if v > hi { v - hi } else { 0.0 };
                d * d
            })
            .sum()
    }

    /// Optimized vector from a search point; excluded fractions are set to an
    /// equal share.
    pub fn to_optimized(&self, x: &[f64]) -> Vec<f64> {
        let n = self.excluded_fractions();
        let equal = if n > 0 { vec![1.0 / n as f64; n] } else { Vec::new() };
        self.to_optimized_with_fractions(x, &equal)
    }

    /// Optimized vector from a search point plus the excluded fractions.
    pub fn to_optimized_with_fractions(&self, x: &[f64], fractions: &[f64]) -> Vec<f64> {
        let x = self.clamp(x);
        let mut out = vec![0.0; self.optimized_len];
        for (c, &v) in self.components.iter().zip(&x) {
            out[c.position] = v * c.scale;
        }
        if self.nested {
            let nested = &x[self.components.len()..];
            let mut remaining = self.budget;
            for (k, &pos) in self.fraction_positions.iter().enumerate() {
                let f = match nested.get(k) {
                    Some(&share) => remaining * share,
                    None => remaining,
                };
                out[pos] = f;
                remaining -= f;
            }
        } else {
            for (&pos, &f) in self.fraction_positions.iter().zip(fractions) {
                out[pos] = f;
            }
        }
        out
    }

    /// Search point of an optimized vector (inverse of `to_optimized`).
    pub fn from_optimized(&self, optimized: &[f64]) -> Vec<f64> {
        let mut x: Vec<f64> = self.components.iter().map(|c| optimized[c.position] / c.scale).collect();
        if self.nested {
            let mut remaining = self.budget;
            for &pos in &self.fraction_positions[..self.fraction_positions.len() - 1] {
                let f = optimized[pos].max(0.0);
                let share = if remaining > 1e-12 { (f / remaining).clamp(0.0, 1.0) } else { 0.0 };
                x.push(share);
                remaining = (remaining - f).max(0.0);
            }
        }
        self.clamp(&x)
    }

    /// Fractions stored in an optimized vector at the excluded positions.
    pub fn fractions_of(&self, optimized: &[f64]) -> Vec<f64> {
        self.fraction_positions.iter().map(|&p| optimized[p]).collect()
    }

    /// Search indices of orientation `θ` components (`φ` follows each).
    pub fn orientation_starts(&self) -> Vec<usize> {
        let kinds = self.kinds();
        let mut out = Vec::new();
        let mut i = 0;
        while i < kinds.len() {
            if kinds[i] == ParameterKind::Orientation {
                out.push(i);
                i += 2;
            } else {
                i += 1;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Compartment;

    fn stick_ball() -> MultiCompartmentModel {
        MultiCompartmentModel::new(vec![Compartment::stick(), Compartment::Ball]).unwrap()
    }

    #[test]
    fn nested_fractions_lie_on_the_simplex() {
        let mc = MultiCompartmentModel::new(vec![Compartment::stick(), Compartment::zeppelin(), Compartment::Ball])
            .unwrap();
        let space = SearchSpace::new(&mc, FractionHandling::Nested).unwrap();
        // mu(2) + lambda_par + mu(2) + lambda_par + lambda_perp + lambda_iso + 2 nested
        assert_eq!(space.dim(), 10);
        let mut x: Vec<f64> = space.bounds().iter().map(|(lo, hi)| 0.5 * (lo + hi)).collect();
        x[8] = 0.6;
        x[9] = 0.5;
        let opt = space.to_optimized(&x);
        let f: Vec<f64> = space.fractions_of(&opt);
        assert!((f[0] - 0.6).abs() < 1e-12);
        assert!((f[1] - 0.2).abs() < 1e-12);
        assert!((f.iter().sum::<f64>() - 1.0).abs() < 1e-12);

        let back = space.from_optimized(&opt);
        for (a, b) in back.iter().zip(&x) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn scaled_units_convert_to_si() {
        let space = SearchSpace::new(&stick_ball(), FractionHandling::Nested).unwrap();
        let opt = space.to_optimized(&[0.3, 0.2, 1.7, 3.0, 0.4]);
        assert!((opt[2] - 1.7e-9).abs() < 1e-21);
        assert!((opt[3] - 3.0e-9).abs() < 1e-21);
        assert!((opt[4] - 0.4).abs() < 1e-12);
        assert!((opt[5] - 0.6).abs() < 1e-12);
        assert_eq!(space.orientation_starts(), vec![0]);
    }

    #[test]
    fn excluded_fractions_are_supplied_by_caller() {
        let space = SearchSpace::new(&stick_ball(), FractionHandling::Excluded).unwrap();
        assert_eq!(space.dim(), 4);
        assert_eq!(space.excluded_fractions(), 2);
        let opt = space.to_optimized_with_fractions(&[0.3, 0.2, 1.7, 3.0], &[0.7, 0.3]);
        assert_eq!(&opt[4..], &[0.7, 0.3]);
    }

    #[test]
    fn fixed_fraction_leaves_the_rest_of_the_simplex() {
        let mut mc = stick_ball();
        mc.set_fixed_parameter("partial_volume_1", vec![0.3]).unwrap();
        let space = SearchSpace::new(&mc, FractionHandling::Nested).unwrap();
        assert_eq!(space.dim(), 4);
        let opt = space.to_optimized(&[0.3, 0.2, 1.7, 3.0]);
        assert!((opt[4] - 0.7).abs() < 1e-12);
        assert!(SearchSpace::new(&mc, FractionHandling::Excluded).is_err());

        let mut three =
            MultiCompartmentModel::new(vec![Compartment::stick(), Compartment::zeppelin(), Compartment::Ball])
                .unwrap();
        three.set_fixed_parameter("partial_volume_2", vec![0.2]).unwrap();
        let space = SearchSpace::new(&three, FractionHandling::Nested).unwrap();
        let mut x: Vec<f64> = space.bounds().iter().map(|(lo, hi)| 0.5 * (lo + hi)).collect();
        let last = x.len() - 1;
        x[last] = 0.25;
        let opt = space.to_optimized(&x);
        let f = space.fractions_of(&opt);
        assert!((f[0] - 0.2).abs() < 1e-12);
        assert!((f[0] + f[1] - 0.8).abs() < 1e-12);
        let back = space.from_optimized(&opt);
        assert!((back[last] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn equal_linked_fraction_keeps_box_fractions() {
        let mut mc = stick_ball();
        mc.set_equal_parameter("partial_volume_1", "partial_volume_0").unwrap();
        let space = SearchSpace::new(&mc, FractionHandling::Nested).unwrap();
        assert_eq!(space.dim(), 5);
    }

    #[test]
    fn bundle_fractions_stay_in_the_box() {
        let watson = Compartment::watson(vec![crate::domain::KernelKind::Stick, crate::domain::KernelKind::Zeppelin])
            .unwrap();
        let mc = MultiCompartmentModel::new(vec![watson, Compartment::Ball]).unwrap();
        let space = SearchSpace::new(&mc, FractionHandling::Excluded).unwrap();
        assert_eq!(space.excluded_fractions(), 2);
        // mu(2) + kappa + lambda_par + lambda_par + lambda_perp + inner fraction + lambda_iso
        assert_eq!(space.dim(), 8);
    }

    #[test]
    fn clamp_and_excess() {
        let space = SearchSpace::new(&stick_ball(), FractionHandling::Nested).unwrap();
        let x = [-1.0, 0.0, 5.0, 1.0, 0.5];
        let c = space.clamp(&x);
        assert_eq!(c[0], 0.0);
        assert_eq!(c[2], 3.0);
        assert!((space.excess(&x) - (1.0 + 4.0)).abs() < 1e-12);
    }
}
