//! Non-negative least squares (Lawson–Hanson active set).
//!
//! ```text
//! minimize ‖A x - b‖²  subject to  x ≥ 0
//! ```
//!
//! Volume fractions enter every multi-compartment model linearly, so once the
//! non-linear parameters are fixed the fractions are exactly an NNLS problem.
//! Problems here are tiny (one column per compartment), so each inner solve
//! reuses the SVD least-squares routine.

use nalgebra::{DMatrix, DVector};

use crate::math::ols::solve_least_squares;

/// Tolerance on the dual vector used to decide optimality.
const DUAL_TOL: f64 = 1e-12;

/// Solve the NNLS problem. Returns `None` if an inner least-squares solve fails.
pub fn nnls(a: &DMatrix<f64>, b: &DVector<f64>, max_iter: usize) -> Option<DVector<f64>> {
    let n = a.ncols();
    let mut x = DVector::<f64>::zeros(n);
    if n == 0 {
        return Some(x);
    }
    let mut passive = vec![false; n];
    let max_iter = max_iter.max(3 * n);

    for _ in 0..max_iter {
        let w = a.transpose() * (b - a * &x);

        // Most promising inactive column.
        let mut best: Option<(usize, f64)> = None;
        for j in 0..n {
            if !passive[j] && w[j] > DUAL_TOL && best.is_none_or(|(_, v)| w[j] > v) {
                best = Some((j, w[j]));
            }
        }
        let Some((j, _)) = best else {
            break;
        };
        passive[j] = true;

        loop {
            let cols: Vec<usize> = (0..n).filter(|&k| passive[k]).collect();
            let sub = a.select_columns(cols.iter());
            let z_sub = solve_least_squares(&sub, b)?;
            let mut z = DVector::<f64>::zeros(n);
            for (i, &k) in cols.iter().enumerate() {
                z[k] = z_sub[i];
            }

            if cols.iter().all(|&k| z[k] > 0.0) {
                x = z;
                break;
            }

            // Step towards z until the first passive variable hits zero.
            let mut alpha = f64::INFINITY;
            for &k in &cols {
                if z[k] <= 0.0 {
                    let denom = x[k] - z[k];
                    if denom > 0.0 {
                        alpha = alpha.min(x[k] / denom);
                    }
                }
            }
            if !alpha.is_finite() {
                alpha = 0.0;
            }
            x += (z - &x) * alpha;
            for &k in &cols {
                if x[k] <= DUAL_TOL {
                    x[k] = 0.0;
                    passive[k] = false;
                }
            }
            if passive.iter().all(|p| !p) {
                break;
            }
        }
    }

    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nnls_matches_unconstrained_when_feasible() {
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let b = DVector::from_row_slice(&[0.3, 0.7, 1.0]);
        let x = nnls(&a, &b, 50).unwrap();
        assert!((x[0] - 0.3).abs() < 1e-10);
        assert!((x[1] - 0.7).abs() < 1e-10);
    }

    #[test]
    fn nnls_clamps_negative_components() {
        // Unconstrained solution is (2, -1); the constrained optimum drops x1.
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        let b = DVector::from_row_slice(&[1.0, 0.0, -1.0]);
        let x = nnls(&a, &b, 50).unwrap();
        assert!(x.iter().all(|v| *v >= 0.0));
        assert!(x[1].abs() < 1e-12);
    }
}
