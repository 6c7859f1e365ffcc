//! Acquisition scheme: per-measurement b-values, gradient directions and
//! pulse timings, plus the derived shell structure.
//!
//! Units are SI throughout: b in s/m², q in 1/m, timings in seconds. File
//! readers convert from the usual s/mm² convention.

use std::f64::consts::PI;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Measurements with `b <= B0_THRESHOLD` (10 s/mm²) count as b0.
pub const B0_THRESHOLD: f64 = 10e6;

/// b-values closer than this (50 s/mm²) belong to the same shell.
pub const SHELL_TOLERANCE: f64 = 50e6;

/// Gyromagnetic ratio of hydrogen (rad s⁻¹ T⁻¹).
pub const GYRO_MAGNETIC_RATIO: f64 = 2.675_987e8;

/// Per-measurement pulse timings. Any of them may be unknown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PulseTiming {
    /// Pulse duration δ.
    pub delta: Option<Vec<f64>>,
    /// Pulse separation Δ.
    pub big_delta: Option<Vec<f64>>,
    pub echo_time: Option<Vec<f64>>,
}

impl PulseTiming {
    /// The same timings for all `n` measurements.
    pub fn uniform(n: usize, delta: Option<f64>, big_delta: Option<f64>, echo_time: Option<f64>) -> Self {
        Self {
            delta: delta.map(|v| vec![v; n]),
            big_delta: big_delta.map(|v| vec![v; n]),
            echo_time: echo_time.map(|v| vec![v; n]),
        }
    }

    fn validate(&self, n: usize) -> Result<(), AppError> {
        for (label, values) in [
            ("delta", &self.delta),
            ("big_delta", &self.big_delta),
            ("echo_time", &self.echo_time),
        ] {
            if let Some(v) = values {
                if v.len() != n {
                    return Err(AppError::input(format!(
                        "Timing '{label}' has {} entries, expected {n}.",
                        v.len()
                    )));
                }
                if v.iter().any(|x| !(x.is_finite() && *x > 0.0)) {
                    return Err(AppError::input(format!("Timing '{label}' must be finite and > 0.")));
                }
            }
        }
        if let (Some(d), Some(bd)) = (&self.delta, &self.big_delta) {
            if d.iter().zip(bd).any(|(d, bd)| bd - d / 3.0 <= 0.0) {
                return Err(AppError::input("Pulse timings must satisfy Δ > δ/3."));
            }
        }
        Ok(())
    }

    fn at(values: &Option<Vec<f64>>, i: usize) -> Option<f64> {
        values.as_ref().map(|v| v[i])
    }
}

/// A group of measurements sharing b-value and timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shell {
    pub index: usize,
    /// Mean b-value of the members (s/m²).
    pub bvalue: f64,
    /// Mean q-value (1/m) when timings are known.
    pub qvalue: Option<f64>,
    pub delta: Option<f64>,
    pub big_delta: Option<f64>,
    pub echo_time: Option<f64>,
    pub is_b0: bool,
    pub measurements: Vec<usize>,
}

/// The quantities a compartment kernel needs for one measurement or shell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub bvalue: f64,
    pub qvalue: Option<f64>,
}

impl Shell {
    pub fn measurement(&self) -> Measurement {
        Measurement {
            bvalue: self.bvalue,
            qvalue: self.qvalue,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionScheme {
    bvalues: Vec<f64>,
    directions: Vec<Vector3<f64>>,
    qvalues: Option<Vec<f64>>,
    timing: PulseTiming,
    b0_threshold: f64,
    shells: Vec<Shell>,
    shell_of: Vec<usize>,
}

impl AcquisitionScheme {
    /// Build a scheme from b-values (s/m²) and gradient directions.
    ///
    /// Directions of DWIs are normalised; b0 measurements may use the zero
    /// vector. q-values are derived when both δ and Δ are known.
    pub fn from_bvalues(
        bvalues: Vec<f64>,
        directions: Vec<[f64; 3]>,
        timing: PulseTiming,
        b0_threshold: f64,
    ) -> Result<Self, AppError> {
        let n = bvalues.len();
        if n == 0 {
            return Err(AppError::data("Acquisition scheme has no measurements."));
        }
        if directions.len() != n {
            return Err(AppError::input(format!(
                "Got {n} b-values but {} gradient directions.",
                directions.len()
            )));
        }
        if bvalues.iter().any(|b| !(b.is_finite() && *b >= 0.0)) {
            return Err(AppError::input("b-values must be finite and >= 0."));
        }
        if !(b0_threshold.is_finite() && b0_threshold >= 0.0) {
            return Err(AppError::input("b0 threshold must be finite and >= 0."));
        }
        timing.validate(n)?;

        let mut dirs = Vec::with_capacity(n);
        for (i, (d, &b)) in directions.iter().zip(&bvalues).enumerate() {
            let v = Vector3::new(d[0], d[1], d[2]);
            let norm = v.norm();
            if !norm.is_finite() {
                return Err(AppError::input(format!("Gradient direction {i} is not finite.")));
            }
            if b > b0_threshold {
                if norm < 1e-6 {
                    return Err(AppError::input(format!(
                        "Gradient direction {i} is zero for a diffusion-weighted measurement."
                    )));
                }
                dirs.push(v / norm);
            } else if norm > 1e-6 {
                dirs.push(v / norm);
            } else {
                dirs.push(Vector3::zeros());
            }
        }

        let qvalues = match (&timing.delta, &timing.big_delta) {
            (Some(d), Some(bd)) => Some(
                bvalues
                    .iter()
                    .zip(d.iter().zip(bd))
                    .map(|(&b, (&d, &bd))| (b / (bd - d / 3.0)).sqrt() / (2.0 * PI))
                    .collect(),
            ),
            _ => None,
        };

        let (shells, shell_of) = cluster_shells(&bvalues, qvalues.as_deref(), &timing, b0_threshold);

        Ok(Self {
            bvalues,
            directions: dirs,
            qvalues,
            timing,
            b0_threshold,
            shells,
            shell_of,
        })
    }

    /// Build a scheme from q-values (1/m); δ and Δ are required.
    pub fn from_qvalues(
        qvalues: Vec<f64>,
        directions: Vec<[f64; 3]>,
        timing: PulseTiming,
        b0_threshold: f64,
    ) -> Result<Self, AppError> {
        let (Some(d), Some(bd)) = (&timing.delta, &timing.big_delta) else {
            return Err(AppError::input("Building a scheme from q-values requires delta and big_delta."));
        };
        if d.len() != qvalues.len() || bd.len() != qvalues.len() {
            return Err(AppError::input("Timing vectors must match the number of q-values."));
        }
        let bvalues = qvalues
            .iter()
            .zip(d.iter().zip(bd))
            .map(|(&q, (&d, &bd))| (2.0 * PI * q).powi(2) * (bd - d / 3.0))
            .collect();
        Self::from_bvalues(bvalues, directions, timing, b0_threshold)
    }

    pub fn n_measurements(&self) -> usize {
        self.bvalues.len()
    }

    pub fn bvalues(&self) -> &[f64] {
        &self.bvalues
    }

    pub fn directions(&self) -> &[Vector3<f64>] {
        &self.directions
    }

    pub fn qvalues(&self) -> Option<&[f64]> {
        self.qvalues.as_deref()
    }

    pub fn timing(&self) -> &PulseTiming {
        &self.timing
    }

    pub fn b0_threshold(&self) -> f64 {
        self.b0_threshold
    }

    pub fn shells(&self) -> &[Shell] {
        &self.shells
    }

    /// Shell index of every measurement.
    pub fn shell_indices(&self) -> &[usize] {
        &self.shell_of
    }

    pub fn measurement(&self, i: usize) -> Measurement {
        Measurement {
            bvalue: self.bvalues[i],
            qvalue: self.qvalues.as_ref().map(|q| q[i]),
        }
    }

    pub fn b0_mask(&self) -> Vec<bool> {
        self.bvalues.iter().map(|&b| b <= self.b0_threshold).collect()
    }

    pub fn b0_indices(&self) -> Vec<usize> {
        (0..self.n_measurements())
            .filter(|&i| self.bvalues[i] <= self.b0_threshold)
            .collect()
    }

    pub fn dwi_indices(&self) -> Vec<usize> {
        (0..self.n_measurements())
            .filter(|&i| self.bvalues[i] > self.b0_threshold)
            .collect()
    }

    pub fn has_b0(&self) -> bool {
        self.bvalues.iter().any(|&b| b <= self.b0_threshold)
    }

    /// Shells that are diffusion weighted.
    pub fn dwi_shells(&self) -> impl Iterator<Item = &Shell> {
        self.shells.iter().filter(|s| !s.is_b0)
    }

    pub fn unique_dwi_bvalues(&self) -> Vec<f64> {
        self.dwi_shells().map(|s| s.bvalue).collect()
    }

    /// Tabular summary in the spirit of a scanner protocol printout.
    pub fn summary(&self) -> String {
        let n_b0 = self.b0_indices().len();
        let n_dwi_shells = self.dwi_shells().count();
        let mut out = String::new();
        out.push_str("Acquisition scheme summary\n\n");
        out.push_str(&format!("total number of measurements: {}\n", self.n_measurements()));
        out.push_str(&format!("number of b0 measurements: {n_b0}\n"));
        out.push_str(&format!("number of DWI shells: {n_dwi_shells}\n\n"));
        out.push_str(&format!(
            "{:>11} |{:>9} |{:>16} |{:>25} |{:>10} |{:>10} |{:>7}\n",
            "shell_index", "# of DWIs", "bvalue [s/mm^2]", "gradient strength [mT/m]", "delta [ms]", "Delta[ms]", "TE[ms]"
        ));
        for s in &self.shells {
            let strength = match (s.qvalue, s.delta) {
                (Some(q), Some(d)) => format_opt(Some(2.0 * PI * q / (GYRO_MAGNETIC_RATIO * d) * 1e3), 0),
                _ => "N/A".to_string(),
            };
            out.push_str(&format!(
                "{:>11} |{:>9} |{:>16} |{:>25} |{:>10} |{:>10} |{:>7}\n",
                s.index,
                s.measurements.len(),
                format!("{:.0}", s.bvalue / 1e6),
                strength,
                format_opt(s.delta.map(|v| v * 1e3), 1),
                format_opt(s.big_delta.map(|v| v * 1e3), 1),
                format_opt(s.echo_time.map(|v| v * 1e3), 1),
            ));
        }
        out
    }
}

fn format_opt(v: Option<f64>, decimals: usize) -> String {
    match v {
        Some(v) => format!("{v:.decimals$}"),
        None => "N/A".to_string(),
    }
}

/// Group measurements into shells.
///
/// Measurements are visited in order of increasing b; a measurement joins an
/// existing shell when its b-value is within `SHELL_TOLERANCE` of the shell's
/// first member and its timings match. All b0 measurements with identical
/// timings form one b0 shell.
fn cluster_shells(
    bvalues: &[f64],
    qvalues: Option<&[f64]>,
    timing: &PulseTiming,
    b0_threshold: f64,
) -> (Vec<Shell>, Vec<usize>) {
    let n = bvalues.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        bvalues[a]
            .partial_cmp(&bvalues[b])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });

    struct Group {
        anchor_b: f64,
        delta: Option<f64>,
        big_delta: Option<f64>,
        echo_time: Option<f64>,
        is_b0: bool,
        members: Vec<usize>,
    }

    let same = |a: Option<f64>, b: Option<f64>| match (a, b) {
        (Some(a), Some(b)) => (a - b).abs() <= 1e-6 * a.abs().max(b.abs()),
        (None, None) => true,
        _ => false,
    };

    let mut groups: Vec<Group> = Vec::new();
    for &i in &order {
        let b = bvalues[i];
        let is_b0 = b <= b0_threshold;
        let delta = PulseTiming::at(&timing.delta, i);
        let big_delta = PulseTiming::at(&timing.big_delta, i);
        let echo_time = PulseTiming::at(&timing.echo_time, i);

        let found = groups.iter_mut().find(|g| {
            g.is_b0 == is_b0
                && (is_b0 || (b - g.anchor_b).abs() <= SHELL_TOLERANCE)
                && same(g.delta, delta)
                && same(g.big_delta, big_delta)
                && same(g.echo_time, echo_time)
        });
        match found {
            Some(g) => g.members.push(i),
            None => groups.push(Group {
                anchor_b: b,
                delta,
                big_delta,
                echo_time,
                is_b0,
                members: vec![i],
            }),
        }
    }

    let mut shell_of = vec![0; n];
    let shells = groups
        .into_iter()
        .enumerate()
        .map(|(index, mut g)| {
            g.members.sort_unstable();
            let count = g.members.len() as f64;
            let bvalue = g.members.iter().map(|&i| bvalues[i]).sum::<f64>() / count;
            let qvalue = qvalues.map(|q| g.members.iter().map(|&i| q[i]).sum::<f64>() / count);
            for &i in &g.members {
                shell_of[i] = index;
            }
            Shell {
                index,
                bvalue,
                qvalue,
                delta: g.delta,
                big_delta: g.big_delta,
                echo_time: g.echo_time,
                is_b0: g.is_b0,
                measurements: g.members,
            }
        })
        .collect();

    (shells, shell_of)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_shell_scheme() -> AcquisitionScheme {
        let bvals = vec![0.0, 1000e6, 1010e6, 3000e6, 5e6, 2990e6];
        let dirs = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 2.0, 0.0],
            [0.0, 0.0, 1.0],
            [0.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
        ];
        let timing = PulseTiming::uniform(6, Some(0.0106), Some(0.0431), Some(0.0895));
        AcquisitionScheme::from_bvalues(bvals, dirs, timing, B0_THRESHOLD).unwrap()
    }

    #[test]
    fn shells_are_clustered_by_bvalue() {
        let scheme = two_shell_scheme();
        assert_eq!(scheme.shells().len(), 3);
        assert_eq!(scheme.b0_indices(), vec![0, 4]);
        let dwi = scheme.unique_dwi_bvalues();
        assert!((dwi[0] - 1005e6).abs() < 1.0);
        assert!((dwi[1] - 2995e6).abs() < 1.0);
        assert_eq!(scheme.shell_indices()[2], scheme.shell_indices()[1]);
    }

    #[test]
    fn directions_are_normalised() {
        let scheme = two_shell_scheme();
        assert!((scheme.directions()[2].norm() - 1.0).abs() < 1e-12);
        assert!((scheme.directions()[5].norm() - 1.0).abs() < 1e-12);
        assert_eq!(scheme.directions()[0].norm(), 0.0);
    }

    #[test]
    fn bvalue_and_qvalue_constructors_agree() {
        let scheme = two_shell_scheme();
        let q = scheme.qvalues().unwrap().to_vec();
        let dirs: Vec<[f64; 3]> = scheme.directions().iter().map(|d| [d.x, d.y, d.z]).collect();
        let rebuilt =
            AcquisitionScheme::from_qvalues(q, dirs, scheme.timing().clone(), B0_THRESHOLD).unwrap();
        for (a, b) in scheme.bvalues().iter().zip(rebuilt.bvalues()) {
            assert!((a - b).abs() <= 1e-6 * a.max(1.0));
        }
    }

    #[test]
    fn zero_direction_for_dwi_is_rejected() {
        let err = AcquisitionScheme::from_bvalues(
            vec![1000e6],
            vec![[0.0, 0.0, 0.0]],
            PulseTiming::default(),
            B0_THRESHOLD,
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn summary_lists_every_shell() {
        let text = two_shell_scheme().summary();
        assert!(text.contains("number of DWI shells: 2"));
        assert!(text.contains("number of b0 measurements: 2"));
    }
}
