//! Iterative EPSF building.
//!
//! Each pass resamples the residuals of every normalised star against the
//! current model onto the oversampled grid, combines them per grid point
//! with a sigma-clipped median, adds the result to the model, smooths,
//! recenters and renormalises it. The star centers are then refitted against
//! the new model; stars whose fit fails or wanders off the cut-out are
//! dropped.

use meter_math::LevenbergMarquardt;
use ndarray::{s, Array2, ArrayView2};
use rayon::prelude::*;
use shared::algo::sigma_clipped_median;
use shared::image_proc::{convolve2d, shift_bilinear};

use super::StarCutout;
use crate::config::Config;
use crate::fitter::{fit_group, SourceGuess};
use crate::psf::PsfModel;
use crate::{PhotometryError, Result};

const RESIDUAL_CLIP_SIGMA: f64 = 3.0;
const RESIDUAL_CLIP_ITERS: usize = 10;

/// Recentering box half-width in detector pixels
const RECENTER_HALF_BOX: usize = 2;
const RECENTER_MAX_ITERS: usize = 10;
/// Recentering stops once the centroid is this close, in grid cells
const RECENTER_TOLERANCE: f64 = 1e-3;

/// Build an EPSF from `stars` by iterative refinement.
///
/// Returns the model and the stars that survived every pass, with refined
/// centers and fluxes.
pub fn build_epsf_fit(
    stars: &[StarCutout],
    config: &Config,
) -> Result<(PsfModel, Vec<StarCutout>)> {
    let size = stars.first().map(StarCutout::size).ok_or(PhotometryError::NoStars)?;
    let oversampling = config.oversampling;
    let grid = size * oversampling + 1;
    let kernel = config.smoothing.kernel();
    let solver = LevenbergMarquardt::default().with_max_iterations(config.lm_max_iterations);

    let mut active: Vec<StarCutout> = stars
        .iter()
        .filter(|s| s.data.dim() == (size, size) && s.flux.is_finite() && s.flux > 0.0)
        .cloned()
        .collect();
    let mut psf = PsfModel::new(Array2::zeros((grid, grid)), oversampling)?;

    for iteration in 1..=config.epsfbuilder_iters.max(1) {
        if active.is_empty() {
            return Err(PhotometryError::NoStars);
        }
        let residual = combine_residuals(&psf, &active, grid);
        let mut updated = &psf.data + &residual;
        if let Some(kernel) = &kernel {
            updated = convolve2d(&updated.view(), &kernel.view(), None);
        }
        let updated = recenter(updated, oversampling);
        psf = PsfModel::normalized(updated, oversampling)?;

        let before = active.len();
        active = refit_centers(&psf, active, config.fit_boxsize, &solver);
        log::debug!(
            "EPSF pass {iteration}: {} of {before} stars kept",
            active.len()
        );
    }

    if active.is_empty() {
        return Err(PhotometryError::NoStars);
    }
    Ok((psf, active))
}

/// Per-grid-point sigma-clipped median of the star residuals.
fn combine_residuals(psf: &PsfModel, stars: &[StarCutout], grid: usize) -> Array2<f64> {
    let os = psf.oversampling as f64;
    let center = psf.center();
    let scale = 1.0 / (os * os);

    let mut buckets: Vec<Vec<f64>> = vec![Vec::new(); grid * grid];
    for star in stars {
        let normalized = star.normalized();
        let (cx, cy) = star.cutout_center;
        for ((r, c), &value) in normalized.indexed_iter() {
            let dx = c as f64 - cx;
            let dy = r as f64 - cy;
            let gx = (center + dx * os).round();
            let gy = (center + dy * os).round();
            if gx < 0.0 || gy < 0.0 || gx >= grid as f64 || gy >= grid as f64 {
                continue;
            }
            let resid = value - psf.evaluate(dx, dy);
            buckets[gy as usize * grid + gx as usize].push(resid * scale);
        }
    }

    let combined: Vec<f64> = buckets
        .par_iter()
        .map(|values| {
            sigma_clipped_median(values, RESIDUAL_CLIP_SIGMA, RESIDUAL_CLIP_ITERS).unwrap_or(0.0)
        })
        .collect();
    Array2::from_shape_vec((grid, grid), combined).unwrap_or_else(|_| Array2::zeros((grid, grid)))
}

/// Centroid of the central box of `data` in array coordinates.
fn central_centroid(data: ArrayView2<f64>, half: usize) -> Option<(f64, f64)> {
    let n = data.nrows();
    let c = n / 2;
    let lo = c.saturating_sub(half);
    let hi = (c + half + 1).min(n);
    let window = data.slice(s![lo..hi, lo..hi]);

    let (mut sum, mut sx, mut sy) = (0.0, 0.0, 0.0);
    for ((r, col), &v) in window.indexed_iter() {
        sum += v;
        sx += v * (col + lo) as f64;
        sy += v * (r + lo) as f64;
    }
    (sum > 0.0 && sum.is_finite()).then(|| (sx / sum, sy / sum))
}

/// Shift `data` until the centroid of its core sits on the central sample.
fn recenter(mut data: Array2<f64>, oversampling: usize) -> Array2<f64> {
    let center = (data.nrows() as f64 - 1.0) / 2.0;
    let half = RECENTER_HALF_BOX * oversampling;
    for _ in 0..RECENTER_MAX_ITERS {
        let Some((xc, yc)) = central_centroid(data.view(), half) else {
            break;
        };
        let (dx, dy) = (center - xc, center - yc);
        if dx.hypot(dy) < RECENTER_TOLERANCE {
            break;
        }
        data = shift_bilinear(data.view(), dx, dy);
    }
    data
}

/// Refit each star's center and flux against `psf`.
fn refit_centers(
    psf: &PsfModel,
    stars: Vec<StarCutout>,
    fit_boxsize: usize,
    solver: &LevenbergMarquardt,
) -> Vec<StarCutout> {
    let total = stars.len();
    let kept: Vec<StarCutout> = stars
        .into_par_iter()
        .filter_map(|mut star| {
            let guess = SourceGuess {
                x: star.cutout_center.0,
                y: star.cutout_center.1,
                flux: star.flux,
            };
            let fit = match fit_group(star.data.view(), psf, &[guess], fit_boxsize, solver) {
                Ok(fit) => fit.into_iter().next()?,
                Err(e) => {
                    log::debug!("star {} rejected: {e}", star.id);
                    return None;
                }
            };
            let limit = (star.size() - 1) as f64;
            let inside = (0.0..=limit).contains(&fit.x) && (0.0..=limit).contains(&fit.y);
            if !inside || !(fit.flux.is_finite() && fit.flux > 0.0) {
                log::debug!("star {} rejected: fit left the cut-out", star.id);
                return None;
            }
            star.cutout_center = (fit.x, fit.y);
            star.flux = fit.flux;
            Some(star)
        })
        .collect();
    if kept.len() < total {
        log::warn!("{} of {total} stars rejected while building the EPSF", total - kept.len());
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epsf::testing::star_field;
    use crate::finder::extract_stars;
    use approx::assert_relative_eq;

    #[test]
    fn test_empty_input_is_an_error() {
        let err = build_epsf_fit(&[], &Config::default()).unwrap_err();
        assert!(matches!(err, PhotometryError::NoStars));
    }

    #[test]
    fn test_builds_centered_normalized_model() {
        let (image, candidates) = star_field();
        let config = Config {
            cutout_size: 21,
            ..Config::default()
        };
        let stars = extract_stars(image.view(), &candidates, config.cutout_size);
        assert_eq!(stars.len(), 25);

        let (psf, fitted) = build_epsf_fit(&stars, &config).unwrap();
        assert_eq!(psf.size(), 21 * 4 + 1);
        assert!(psf.normalized);
        assert_relative_eq!(psf.data.sum(), 1.0, epsilon = 1e-9);
        assert_eq!(fitted.len(), 25);

        let peak = psf
            .data
            .indexed_iter()
            .fold(((0, 0), f64::MIN), |best, (idx, &v)| if v > best.1 { (idx, v) } else { best });
        assert!((peak.0 .0 as i64 - 42).abs() <= 1 && (peak.0 .1 as i64 - 42).abs() <= 1);

        for (star, truth) in fitted.iter().zip(&candidates) {
            let (x, y) = star.center();
            assert!((x - truth.x).abs() < 0.1, "star {} x {x} vs {}", star.id, truth.x);
            assert!((y - truth.y).abs() < 0.1, "star {} y {y} vs {}", star.id, truth.y);
        }

        let fwhm = psf.fwhm_estimate().unwrap();
        assert!(fwhm > 3.0 && fwhm < 4.6, "fwhm {fwhm}");
    }

    #[test]
    fn test_recenter_moves_offset_blob() {
        let data = Array2::from_shape_fn((41, 41), |(r, c)| {
            let dx = c as f64 - 21.5;
            let dy = r as f64 - 19.0;
            (-(dx * dx + dy * dy) / 18.0).exp()
        });
        let centered = recenter(data, 4);
        let (xc, yc) = central_centroid(centered.view(), 8).unwrap();
        assert!((xc - 20.0).abs() < 0.05 && (yc - 20.0).abs() < 0.05);
    }
}
