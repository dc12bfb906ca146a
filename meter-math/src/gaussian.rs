//! Gaussian profile fits used for FWHM estimates.

use nalgebra::{DMatrix, DVector};
use ndarray::ArrayView2;

use crate::lm::{LeastSquaresProblem, LevenbergMarquardt, LmError};

/// `FWHM / σ` for a Gaussian, `2·sqrt(2·ln 2)`.
pub const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949;

/// Best-fit circular Gaussian `A·exp(-r²/2σ²) + B`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianFit {
    pub amplitude: f64,
    pub x0: f64,
    pub y0: f64,
    pub sigma: f64,
    pub background: f64,
}

impl GaussianFit {
    pub fn fwhm(&self) -> f64 {
        FWHM_PER_SIGMA * self.sigma
    }
}

struct SymmetricGaussian<'a> {
    data: ArrayView2<'a, f64>,
}

impl SymmetricGaussian<'_> {
    fn model_and_gradient(&self, p: &DVector<f64>, x: f64, y: f64) -> (f64, [f64; 5]) {
        let (amp, x0, y0, sigma, _bg) = (p[0], p[1], p[2], p[3], p[4]);
        let dx = x - x0;
        let dy = y - y0;
        let s2 = sigma * sigma;
        let e = (-(dx * dx + dy * dy) / (2.0 * s2)).exp();
        let ae = amp * e;
        (
            ae + p[4],
            [
                e,
                ae * dx / s2,
                ae * dy / s2,
                ae * (dx * dx + dy * dy) / (s2 * sigma),
                1.0,
            ],
        )
    }
}

impl LeastSquaresProblem for SymmetricGaussian<'_> {
    fn num_params(&self) -> usize {
        5
    }

    fn residuals(&self, p: &DVector<f64>) -> DVector<f64> {
        let (rows, cols) = self.data.dim();
        DVector::from_iterator(
            rows * cols,
            self.data.indexed_iter().map(|((r, c), &v)| {
                v - self.model_and_gradient(p, c as f64, r as f64).0
            }),
        )
    }

    fn jacobian(&self, p: &DVector<f64>) -> DMatrix<f64> {
        let (rows, cols) = self.data.dim();
        let mut jac = DMatrix::zeros(rows * cols, 5);
        for (i, ((r, c), _)) in self.data.indexed_iter().enumerate() {
            let (_, grad) = self.model_and_gradient(p, c as f64, r as f64);
            for (j, g) in grad.iter().enumerate() {
                jac[(i, j)] = *g;
            }
        }
        jac
    }

    fn constrain(&self, p: &mut DVector<f64>) {
        p[3] = p[3].abs().max(1e-3);
    }
}

/// Fit a circular Gaussian plus constant to `data`.
///
/// Initial guesses come from the data: the peak pixel for the center, the
/// minimum for the background and `initial_sigma` for the width.
pub fn fit_symmetric_gaussian(
    data: ArrayView2<f64>,
    initial_sigma: f64,
) -> Result<GaussianFit, LmError> {
    let (rows, cols) = data.dim();
    let mut peak = (0usize, 0usize, f64::NEG_INFINITY);
    let mut floor = f64::INFINITY;
    for ((r, c), &v) in data.indexed_iter() {
        if v > peak.2 {
            peak = (r, c, v);
        }
        floor = floor.min(v);
    }
    if rows * cols < 5 || !peak.2.is_finite() || !floor.is_finite() {
        return Err(LmError::Underdetermined {
            params: 5,
            residuals: rows * cols,
        });
    }

    let initial = DVector::from_vec(vec![
        peak.2 - floor,
        peak.1 as f64,
        peak.0 as f64,
        initial_sigma.max(0.1),
        floor,
    ]);
    let report = LevenbergMarquardt::default()
        .with_max_iterations(200)
        .minimize(&SymmetricGaussian { data }, initial)?;
    let p = report.params;
    Ok(GaussianFit {
        amplitude: p[0],
        x0: p[1],
        y0: p[2],
        sigma: p[3],
        background: p[4],
    })
}
