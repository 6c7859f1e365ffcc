//! Numerical building blocks: spherical geometry, Legendre/SH bases,
//! least-squares solvers and special functions.

pub mod legendre;
pub mod nnls;
pub mod ols;
pub mod sh;
pub mod special;
pub mod sphere;

pub use nnls::*;
pub use ols::*;
pub use sphere::*;
