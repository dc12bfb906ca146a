//! Star profile rendering onto an image grid.
//!
//! Pixel `(x, y)` covers `[x - 0.5, x + 0.5) × [y - 0.5, y + 0.5)`, so a star
//! at integer coordinates is centered on a pixel.

use ndarray::Array2;
use scilib::math::basic::erf;
use std::f64::consts::{PI, SQRT_2};

/// Radial profile of a single star.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum StarProfile {
    /// Circular Gaussian with standard deviation `sigma` pixels
    Gaussian { sigma: f64 },
    /// Moffat `(1 + r²/α²)^-β`
    Moffat { alpha: f64, beta: f64 },
}

impl StarProfile {
    /// Half-width in pixels of the box that receives flux.
    fn render_radius(&self) -> i64 {
        match *self {
            StarProfile::Gaussian { sigma } => (6.0 * sigma).ceil().max(2.0) as i64,
            // Moffat wings are heavy; 99% of flux sits inside α·sqrt(100^(1/(β-1)) - 1)
            StarProfile::Moffat { alpha, beta } => {
                let r99 = alpha * (100f64.powf(1.0 / (beta - 1.0)) - 1.0).sqrt();
                r99.ceil().clamp(3.0, 128.0) as i64
            }
        }
    }

    pub fn fwhm(&self) -> f64 {
        match *self {
            StarProfile::Gaussian { sigma } => 2.0 * (2.0 * 2f64.ln()).sqrt() * sigma,
            StarProfile::Moffat { alpha, beta } => {
                2.0 * alpha * (2f64.powf(1.0 / beta) - 1.0).sqrt()
            }
        }
    }
}

/// Fraction of a unit Gaussian between `a` and `b` (in sigmas from center).
fn gaussian_interval(a: f64, b: f64) -> f64 {
    0.5 * (erf(b / SQRT_2) - erf(a / SQRT_2))
}

/// Add a pixel-integrated circular Gaussian of total `flux` centered at `(x, y)`.
///
/// Pixels outside the image are skipped, so stars near the border lose the
/// clipped part of their flux.
pub fn add_gaussian_star(image: &mut Array2<f64>, x: f64, y: f64, flux: f64, sigma: f64) {
    let radius = StarProfile::Gaussian { sigma }.render_radius();
    let (rows, cols) = image.dim();
    let xc = x.round() as i64;
    let yc = y.round() as i64;

    // Separable profile: precompute the per-column and per-row fractions
    let weights = |center: f64, start: i64, len: usize| -> Vec<f64> {
        (0..len)
            .map(|i| {
                let p = (start + i as i64) as f64;
                gaussian_interval((p - 0.5 - center) / sigma, (p + 0.5 - center) / sigma)
            })
            .collect()
    };

    let x0 = (xc - radius).max(0);
    let x1 = (xc + radius).min(cols as i64 - 1);
    let y0 = (yc - radius).max(0);
    let y1 = (yc + radius).min(rows as i64 - 1);
    if x0 > x1 || y0 > y1 {
        return;
    }
    let wx = weights(x, x0, (x1 - x0 + 1) as usize);
    let wy = weights(y, y0, (y1 - y0 + 1) as usize);

    for (j, fy) in wy.iter().enumerate() {
        for (i, fx) in wx.iter().enumerate() {
            image[[(y0 as usize) + j, (x0 as usize) + i]] += flux * fx * fy;
        }
    }
}

/// Add a Moffat star of total `flux` (over the infinite plane) at `(x, y)`.
///
/// Each pixel is integrated with a 5×5 grid of sub-samples.
pub fn add_moffat_star(image: &mut Array2<f64>, x: f64, y: f64, flux: f64, alpha: f64, beta: f64) {
    const SUBSAMPLES: usize = 5;
    let radius = StarProfile::Moffat { alpha, beta }.render_radius();
    let (rows, cols) = image.dim();
    let xc = x.round() as i64;
    let yc = y.round() as i64;

    let amplitude = flux * (beta - 1.0) / (PI * alpha * alpha);
    let step = 1.0 / SUBSAMPLES as f64;
    let alpha_sq = alpha * alpha;

    for py in (yc - radius).max(0)..=(yc + radius).min(rows as i64 - 1) {
        for px in (xc - radius).max(0)..=(xc + radius).min(cols as i64 - 1) {
            let mut sum = 0.0;
            for sy in 0..SUBSAMPLES {
                let dy = py as f64 - 0.5 + (sy as f64 + 0.5) * step - y;
                for sx in 0..SUBSAMPLES {
                    let dx = px as f64 - 0.5 + (sx as f64 + 0.5) * step - x;
                    sum += (1.0 + (dx * dx + dy * dy) / alpha_sq).powf(-beta);
                }
            }
            image[[py as usize, px as usize]] += amplitude * sum * step * step;
        }
    }
}

/// Add a star with the given profile.
pub fn add_star(image: &mut Array2<f64>, profile: &StarProfile, x: f64, y: f64, flux: f64) {
    match *profile {
        StarProfile::Gaussian { sigma } => add_gaussian_star(image, x, y, flux, sigma),
        StarProfile::Moffat { alpha, beta } => add_moffat_star(image, x, y, flux, alpha, beta),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn centroid(image: &Array2<f64>) -> (f64, f64) {
        let total = image.sum();
        let (mut cx, mut cy) = (0.0, 0.0);
        for ((r, c), &v) in image.indexed_iter() {
            cx += c as f64 * v;
            cy += r as f64 * v;
        }
        (cx / total, cy / total)
    }

    #[test]
    fn test_gaussian_total_flux() {
        for sigma in [1.0, 2.0, 4.0] {
            let mut image = Array2::zeros((64, 64));
            add_gaussian_star(&mut image, 31.3, 32.6, 1000.0, sigma);
            assert_relative_eq!(image.sum(), 1000.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_gaussian_centering() {
        let mut image = Array2::zeros((40, 40));
        add_gaussian_star(&mut image, 19.27, 20.61, 500.0, 1.5);
        let (cx, cy) = centroid(&image);
        assert_relative_eq!(cx, 19.27, epsilon = 1e-6);
        assert_relative_eq!(cy, 20.61, epsilon = 1e-6);
    }

    #[test]
    fn test_gaussian_half_off_edge() {
        let mut image = Array2::zeros((50, 50));
        add_gaussian_star(&mut image, -0.5, 25.0, 1000.0, 3.0);
        assert_relative_eq!(image.sum(), 500.0, epsilon = 1e-6);
    }

    #[test]
    fn test_gaussian_far_outside_is_noop() {
        let mut image = Array2::<f64>::zeros((20, 20));
        add_gaussian_star(&mut image, 100.0, 100.0, 1000.0, 2.0);
        assert_eq!(image.sum(), 0.0);
    }

    #[test]
    fn test_moffat_flux_and_center() {
        let mut image = Array2::zeros((128, 128));
        add_moffat_star(&mut image, 64.2, 63.7, 1000.0, 2.0, 3.0);
        // Rendering box holds at least 99% of the flux
        assert!(image.sum() > 990.0 && image.sum() <= 1000.0 + 1e-6);
        let (cx, cy) = centroid(&image);
        assert!((cx - 64.2).abs() < 0.02);
        assert!((cy - 63.7).abs() < 0.02);
    }

    #[test]
    fn test_fwhm() {
        let profile = StarProfile::Gaussian { sigma: 1.0 };
        assert_relative_eq!(profile.fwhm(), 2.354820045, epsilon = 1e-8);
        // β → the standard Moffat FWHM relation
        let m = StarProfile::Moffat { alpha: 2.0, beta: 2.5 };
        assert_relative_eq!(m.fwhm(), 4.0 * (2f64.powf(0.4) - 1.0).sqrt(), epsilon = 1e-12);
    }
}
