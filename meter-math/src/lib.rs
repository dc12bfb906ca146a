//! Numerical building blocks for star measurement.
//!
//! - [`lm`]: a Levenberg-Marquardt least-squares solver over `nalgebra` vectors
//! - [`gaussian`]: Gaussian profile fits built on the solver
//! - [`spatial`]: a 2D k-d tree for neighbour queries on star positions
//! - [`correspondence`]: nearest-neighbour matching between two point sets

pub mod correspondence;
pub mod gaussian;
pub mod lm;
pub mod spatial;

pub use correspondence::{match_nearest, PointMatch};
pub use gaussian::{fit_symmetric_gaussian, GaussianFit, FWHM_PER_SIGMA};
pub use lm::{LeastSquaresProblem, LevenbergMarquardt, LmError, LmReport};
pub use spatial::KdTree;
