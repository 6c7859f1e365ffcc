//! Real, antipodally symmetric spherical harmonics.
//!
//! Only even orders are kept because diffusion signals and fiber ODFs are
//! symmetric under `n → -n`. For order `l` and degree `m ∈ [-l, l]`:
//!
//! - `m < 0`: `√2 N_l^|m| P_l^|m|(cos θ) sin(|m| φ)`
//! - `m = 0`: `N_l^0 P_l^0(cos θ)`
//! - `m > 0`: `√2 N_l^m P_l^m(cos θ) cos(m φ)`
//!
//! with `N_l^m = sqrt((2l+1)/(4π) · (l-m)!/(l+m)!)`. The basis is orthonormal
//! on the sphere. Coefficients are ordered by `l`, then by `m` ascending.
//!
//! Convolution with an axially symmetric kernel `K(g·n)` is diagonal in this
//! basis (Funk–Hecke): `∫ K(g·n) Y_lm(n) dn = λ_l Y_lm(g)` with
//! `λ_l = 2π ∫_{-1}^{1} K(t) P_l(t) dt`.

use std::f64::consts::{PI, SQRT_2};

use nalgebra::{DMatrix, DVector, Vector3};

use crate::math::legendre::{associated_legendre, gauss_legendre, legendre};
use crate::math::sphere::unitvector_to_angles;

/// Number of Gauss–Legendre nodes used for Funk–Hecke integrals.
const FUNK_HECKE_NODES: usize = 96;

/// Number of even-order coefficients up to and including `lmax`.
pub fn n_coefficients(lmax: usize) -> usize {
    let lmax = lmax - lmax % 2;
    (lmax + 1) * (lmax + 2) / 2
}

/// `(l, m)` for every coefficient index up to `lmax`.
pub fn sh_indices(lmax: usize) -> Vec<(usize, i64)> {
    let mut out = Vec::with_capacity(n_coefficients(lmax));
    for l in (0..=lmax).step_by(2) {
        for m in -(l as i64)..=(l as i64) {
            out.push((l, m));
        }
    }
    out
}

/// Evaluate one real SH basis function at `(θ, φ)`.
pub fn real_sh(l: usize, m: i64, theta: f64, phi: f64) -> f64 {
    let am = m.unsigned_abs() as usize;
    if am > l {
        return 0.0;
    }
    let mut ratio = 1.0;
    for k in (l - am + 1)..=(l + am) {
        ratio /= k as f64;
    }
    let norm = ((2.0 * l as f64 + 1.0) / (4.0 * PI) * ratio).sqrt();
    let p = associated_legendre(l, am, theta.cos());
    match m {
        0 => norm * p,
        m if m > 0 => SQRT_2 * norm * p * (m as f64 * phi).cos(),
        _ => SQRT_2 * norm * p * (am as f64 * phi).sin(),
    }
}

/// Basis matrix `B[i, j] = Y_j(dir_i)`.
pub fn sh_matrix(lmax: usize, directions: &[Vector3<f64>]) -> DMatrix<f64> {
    let indices = sh_indices(lmax);
    let mut b = DMatrix::<f64>::zeros(directions.len(), indices.len());
    for (i, dir) in directions.iter().enumerate() {
        let [theta, phi] = unitvector_to_angles(dir);
        for (j, &(l, m)) in indices.iter().enumerate() {
            b[(i, j)] = real_sh(l, m, theta, phi);
        }
    }
    b
}

/// Evaluate an SH expansion on a set of directions.
pub fn sh_to_sf(coefficients: &[f64], lmax: usize, directions: &[Vector3<f64>]) -> Vec<f64> {
    let b = sh_matrix(lmax, directions);
    let c = DVector::from_row_slice(coefficients);
    (b * c).iter().copied().collect()
}

/// Funk–Hecke eigenvalues `λ_l` of an axially symmetric kernel, one entry per
/// even order (`index = l / 2`).
pub fn rotational_harmonics<F>(kernel: F, lmax: usize) -> Vec<f64>
where
    F: Fn(f64) -> f64,
{
    let (nodes, weights) = gauss_legendre(FUNK_HECKE_NODES);
    let values: Vec<f64> = nodes.iter().map(|&t| kernel(t)).collect();
    (0..=lmax)
        .step_by(2)
        .map(|l| {
            let integral: f64 = nodes
                .iter()
                .zip(&weights)
                .zip(&values)
                .map(|((&t, &w), &k)| w * k * legendre(l, t))
                .sum();
            2.0 * PI * integral
        })
        .collect()
}
