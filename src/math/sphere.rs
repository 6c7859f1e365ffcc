//! Orientation helpers and spherical point sets.
//!
//! Orientations are stored as `mu = [θ, φ]` (polar angle from +z, azimuth from
//! +x). Fiber orientations are axes, so `n` and `-n` describe the same fiber.
//!
//! Point sets use the Fibonacci (golden spiral) construction: deterministic,
//! near-uniform, and every point carries the same area, so a plain equal-weight
//! sum is a valid quadrature rule on the sphere.

use std::f64::consts::PI;

use nalgebra::Vector3;

/// Golden angle `π (3 - √5)`.
const GOLDEN_ANGLE: f64 = PI * (3.0 - 2.236_067_977_499_79);

/// Unit vector for spherical angles `(θ, φ)`.
pub fn angles_to_unitvector(theta: f64, phi: f64) -> Vector3<f64> {
    let st = theta.sin();
    Vector3::new(st * phi.cos(), st * phi.sin(), theta.cos())
}

/// Spherical angles `[θ, φ]` of a (not necessarily normalized) vector.
///
/// `θ ∈ [0, π]`, `φ ∈ (-π, π]`. The zero vector maps to `[0, 0]`.
pub fn unitvector_to_angles(v: &Vector3<f64>) -> [f64; 2] {
    let norm = v.norm();
    if norm <= 0.0 || !norm.is_finite() {
        return [0.0, 0.0];
    }
    let z = (v.z / norm).clamp(-1.0, 1.0);
    [z.acos(), v.y.atan2(v.x)]
}

/// Angle in radians between two axes, ignoring sign (`∈ [0, π/2]`).
pub fn axis_angle(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    let na = a.norm();
    let nb = b.norm();
    if na <= 0.0 || nb <= 0.0 {
        return 0.0;
    }
    (a.dot(b).abs() / (na * nb)).clamp(0.0, 1.0).acos()
}

/// A set of unit vectors with quadrature weights that sum to the sphere area
/// covered (`4π` for the full sphere).
#[derive(Debug, Clone, PartialEq)]
pub struct SphereSampling {
    pub vertices: Vec<Vector3<f64>>,
    pub weights: Vec<f64>,
}

impl SphereSampling {
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }
}

/// `n` near-uniform points on the full sphere with equal weights `4π / n`.
pub fn fibonacci_sphere(n: usize) -> SphereSampling {
    let n = n.max(1);
    let mut vertices = Vec::with_capacity(n);
    for i in 0..n {
        let z = 1.0 - (2.0 * i as f64 + 1.0) / n as f64;
        vertices.push(spiral_point(i, z));
    }
    SphereSampling {
        vertices,
        weights: vec![4.0 * PI / n as f64; n],
    }
}

/// `n` near-uniform points on the upper hemisphere (`z > 0`).
///
/// Used wherever antipodal symmetry makes the lower half redundant: brute-force
/// orientation grids, CSD positivity constraints and peak search.
pub fn fibonacci_hemisphere(n: usize) -> Vec<Vector3<f64>> {
    let n = n.max(1);
    (0..n)
        .map(|i| {
            let z = 1.0 - (i as f64 + 0.5) / n as f64;
            spiral_point(i, z)
        })
        .collect()
}

fn spiral_point(i: usize, z: f64) -> Vector3<f64> {
    let r = (1.0 - z * z).max(0.0).sqrt();
    let phi = GOLDEN_ANGLE * i as f64;
    Vector3::new(r * phi.cos(), r * phi.sin(), z)
}

/// Orthonormal pair perpendicular to `mu(θ, φ)`.
///
/// The first vector is `∂mu/∂θ`, the second completes a right-handed frame.
/// Bingham distributions rotate their secondary axis within this plane.
pub fn perpendicular_frame(theta: f64, phi: f64) -> (Vector3<f64>, Vector3<f64>) {
    let mu = angles_to_unitvector(theta, phi);
    let e1 = Vector3::new(
        theta.cos() * phi.cos(),
        theta.cos() * phi.sin(),
        -theta.sin(),
    );
    let e2 = mu.cross(&e1);
    (e1, e2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn angles_round_trip() {
        for &(theta, phi) in &[(0.3, 1.2), (1.5, -2.0), (2.9, 3.0)] {
            let v = angles_to_unitvector(theta, phi);
            let [t, p] = unitvector_to_angles(&v);
            assert!((t - theta).abs() < 1e-12);
            assert!((p - phi).abs() < 1e-12);
        }
    }

    #[test]
    fn fibonacci_points_are_unit_and_weights_cover_sphere() {
        let s = fibonacci_sphere(500);
        assert_eq!(s.len(), 500);
        for v in &s.vertices {
            assert!((v.norm() - 1.0).abs() < 1e-12);
        }
        let area: f64 = s.weights.iter().sum();
        assert!((area - 4.0 * PI).abs() < 1e-9);
    }

    #[test]
    fn hemisphere_stays_on_top() {
        for v in fibonacci_hemisphere(100) {
            assert!(v.z > 0.0);
        }
    }

    #[test]
    fn axis_angle_is_sign_invariant() {
        let a = Vector3::new(0.0, 0.0, 1.0);
        let b = Vector3::new(0.0, 0.0, -1.0);
        assert!(axis_angle(&a, &b) < 1e-12);
        let c = Vector3::new(1.0, 0.0, 0.0);
        assert!((axis_angle(&a, &c) - PI / 2.0).abs() < 1e-12);
    }

    #[test]
    fn perpendicular_frame_is_orthonormal() {
        let (e1, e2) = perpendicular_frame(0.7, -1.1);
        let mu = angles_to_unitvector(0.7, -1.1);
        assert!(e1.dot(&mu).abs() < 1e-12);
        assert!(e2.dot(&mu).abs() < 1e-12);
        assert!(e1.dot(&e2).abs() < 1e-12);
        assert!((e2.norm() - 1.0).abs() < 1e-12);
    }
}
