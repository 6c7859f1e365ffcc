//! Legendre polynomials and Gauss–Legendre quadrature.
//!
//! All evaluations use the three-term recurrences, which are stable for the
//! small orders (`l ≤ 16`) spherical deconvolution needs.

use std::f64::consts::PI;

/// Legendre polynomial `P_l(x)`.
pub fn legendre(l: usize, x: f64) -> f64 {
    match l {
        0 => 1.0,
        1 => x,
        _ => {
            let mut p_prev = 1.0;
            let mut p = x;
            for k in 2..=l {
                let kf = k as f64;
                let next = ((2.0 * kf - 1.0) * x * p - (kf - 1.0) * p_prev) / kf;
                p_prev = p;
                p = next;
            }
            p
        }
    }
}

/// Associated Legendre function `P_l^m(x)` for `0 ≤ m ≤ l`, without the
/// Condon–Shortley phase.
pub fn associated_legendre(l: usize, m: usize, x: f64) -> f64 {
    if m > l {
        return 0.0;
    }
    // P_m^m = (2m-1)!! (1-x²)^{m/2}
    let somx2 = ((1.0 - x) * (1.0 + x)).max(0.0).sqrt();
    let mut pmm = 1.0;
    let mut fact = 1.0;
    for _ in 0..m {
        pmm *= fact * somx2;
        fact += 2.0;
    }
    if l == m {
        return pmm;
    }
    let mut pmmp1 = x * (2.0 * m as f64 + 1.0) * pmm;
    if l == m + 1 {
        return pmmp1;
    }
    let mut pll = 0.0;
    for ll in (m + 2)..=l {
        let llf = ll as f64;
        let mf = m as f64;
        pll = (x * (2.0 * llf - 1.0) * pmmp1 - (llf + mf - 1.0) * pmm) / (llf - mf);
        pmm = pmmp1;
        pmmp1 = pll;
    }
    pll
}

/// Gauss–Legendre nodes and weights on `[-1, 1]` (ascending nodes).
pub fn gauss_legendre(n: usize) -> (Vec<f64>, Vec<f64>) {
    let n = n.max(1);
    let mut nodes = vec![0.0; n];
    let mut weights = vec![0.0; n];
    let nf = n as f64;

    for i in 0..n.div_ceil(2) {
        let mut z = (PI * (i as f64 + 0.75) / (nf + 0.5)).cos();
        let mut pp = 1.0;
        for _ in 0..100 {
            let mut p1 = 1.0;
            let mut p2 = 0.0;
            for j in 1..=n {
                let p3 = p2;
                p2 = p1;
                let jf = j as f64;
                p1 = ((2.0 * jf - 1.0) * z * p2 - (jf - 1.0) * p3) / jf;
            }
            pp = nf * (z * p1 - p2) / (z * z - 1.0);
            let z_prev = z;
            z = z_prev - p1 / pp;
            if (z - z_prev).abs() < 1e-15 {
                break;
            }
        }
        nodes[i] = -z;
        nodes[n - 1 - i] = z;
        let w = 2.0 / ((1.0 - z * z) * pp * pp);
        weights[i] = w;
        weights[n - 1 - i] = w;
    }

    (nodes, weights)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legendre_matches_closed_forms() {
        let x = 0.3;
        assert!((legendre(2, x) - 0.5 * (3.0 * x * x - 1.0)).abs() < 1e-14);
        let p4 = (35.0 * x.powi(4) - 30.0 * x * x + 3.0) / 8.0;
        assert!((legendre(4, x) - p4).abs() < 1e-14);
    }

    #[test]
    fn associated_legendre_matches_closed_forms() {
        let x: f64 = 0.4;
        let s = (1.0 - x * x).sqrt();
        assert!((associated_legendre(2, 0, x) - legendre(2, x)).abs() < 1e-14);
        assert!((associated_legendre(2, 1, x) - 3.0 * x * s).abs() < 1e-14);
        assert!((associated_legendre(2, 2, x) - 3.0 * s * s).abs() < 1e-14);
    }

    #[test]
    fn gauss_legendre_integrates_polynomials_exactly() {
        let (x, w) = gauss_legendre(8);
        let total: f64 = w.iter().sum();
        assert!((total - 2.0).abs() < 1e-13);
        // ∫ x^6 dx over [-1, 1] = 2/7
        let integral: f64 = x.iter().zip(&w).map(|(xi, wi)| wi * xi.powi(6)).sum();
        assert!((integral - 2.0 / 7.0).abs() < 1e-13);
        assert!(x.windows(2).all(|p| p[0] < p[1]));
    }
}
