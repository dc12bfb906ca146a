//! PSF photometry: source grouping and joint fits of position and flux.
//!
//! Sources closer than a critical separation are grouped (DAOGROUP) and each
//! group is fitted as one least-squares problem over the union of the fit
//! boxes of its members, so overlapping light is shared between neighbours.

use meter_math::{KdTree, LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DMatrix, DVector, Vector2};
use ndarray::{s, Array2, ArrayView2};
use rayon::prelude::*;

use crate::config::Config;
use crate::finder::{dao_finder, detection_threshold, find_candidates};
use crate::psf::PsfModel;
use crate::table::{FitRecord, SourceRecord};
use crate::Result;

/// Starting point for one source in a fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceGuess {
    pub x: f64,
    pub y: f64,
    pub flux: f64,
}

/// Group label for each position: connected components of the graph linking
/// positions closer than `crit_separation`.
///
/// Labels are dense and numbered in order of each group's first member.
pub fn group_sources(positions: &[Vector2<f64>], crit_separation: f64) -> Vec<usize> {
    let tree = KdTree::build(positions);
    let mut labels: Vec<Option<usize>> = vec![None; positions.len()];
    let mut next = 0;

    for start in 0..positions.len() {
        if labels[start].is_some() {
            continue;
        }
        labels[start] = Some(next);
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            for neighbour in tree.within_radius(positions[current], crit_separation) {
                let close = (positions[neighbour] - positions[current]).norm() < crit_separation;
                if close && labels[neighbour].is_none() {
                    labels[neighbour] = Some(next);
                    stack.push(neighbour);
                }
            }
        }
        next += 1;
    }

    // Non-finite positions are never found by the tree and end up alone
    labels.into_iter().map(|l| l.unwrap_or(usize::MAX)).collect()
}

/// Pixel range `[lo, hi)` of a box of `size` centered on the pixel containing `c`.
fn box_range(c: f64, size: usize, len: usize) -> (usize, usize) {
    let half = (size / 2) as i64;
    let center = c.round() as i64;
    let lo = (center - half).clamp(0, len as i64) as usize;
    let hi = (center + half + 1).clamp(0, len as i64) as usize;
    (lo, hi)
}

/// Sum of `data` in a `size × size` box around `(x, y)`.
pub fn aperture_flux(data: ArrayView2<f64>, x: f64, y: f64, size: usize) -> f64 {
    let (rows, cols) = data.dim();
    let (x0, x1) = box_range(x, size, cols);
    let (y0, y1) = box_range(y, size, rows);
    data.slice(s![y0..y1, x0..x1]).sum()
}

/// Joint model of several sources sampled on a fixed set of pixels.
///
/// Parameters are `[x, y, flux]` per source.
struct GroupProblem<'a> {
    psf: &'a PsfModel,
    /// Pixel centers `(x, y)`
    pixels: Vec<(f64, f64)>,
    values: DVector<f64>,
    /// Pixels each source can reach, by index into `pixels`
    reach: Vec<Vec<usize>>,
}

impl<'a> GroupProblem<'a> {
    fn new(
        data: ArrayView2<f64>,
        psf: &'a PsfModel,
        guesses: &[SourceGuess],
        fit_shape: usize,
    ) -> Self {
        let (rows, cols) = data.dim();
        let boxes: Vec<((usize, usize), (usize, usize))> = guesses
            .iter()
            .map(|g| (box_range(g.x, fit_shape, cols), box_range(g.y, fit_shape, rows)))
            .collect();
        let bx0 = boxes.iter().map(|b| b.0 .0).min().unwrap_or(0);
        let bx1 = boxes.iter().map(|b| b.0 .1).max().unwrap_or(0);
        let by0 = boxes.iter().map(|b| b.1 .0).min().unwrap_or(0);
        let by1 = boxes.iter().map(|b| b.1 .1).max().unwrap_or(0);

        // Dense lookup from bounding-box pixel to residual index
        let mut index: Array2<Option<usize>> =
            Array2::from_elem((by1.saturating_sub(by0), bx1.saturating_sub(bx0)), None);
        let mut pixels = Vec::new();
        let mut values = Vec::new();
        for &((x0, x1), (y0, y1)) in &boxes {
            for r in y0..y1 {
                for c in x0..x1 {
                    let slot = &mut index[[r - by0, c - bx0]];
                    if slot.is_none() {
                        *slot = Some(pixels.len());
                        pixels.push((c as f64, r as f64));
                        values.push(data[[r, c]]);
                    }
                }
            }
        }

        let extent = psf.shape_in_pixels() + 2;
        let reach = guesses
            .iter()
            .map(|g| {
                let (x0, x1) = box_range(g.x, extent, cols);
                let (y0, y1) = box_range(g.y, extent, rows);
                let (x0, x1) = (x0.max(bx0), x1.min(bx1));
                let (y0, y1) = (y0.max(by0), y1.min(by1));
                let mut hit = Vec::new();
                for r in y0..y1.max(y0) {
                    for c in x0..x1.max(x0) {
                        if let Some(i) = index[[r - by0, c - bx0]] {
                            hit.push(i);
                        }
                    }
                }
                hit
            })
            .collect();

        Self {
            psf,
            pixels,
            values: DVector::from_vec(values),
            reach,
        }
    }

    fn initial(guesses: &[SourceGuess]) -> DVector<f64> {
        DVector::from_iterator(
            guesses.len() * 3,
            guesses.iter().flat_map(|g| [g.x, g.y, g.flux]),
        )
    }
}

impl LeastSquaresProblem for GroupProblem<'_> {
    fn num_params(&self) -> usize {
        self.reach.len() * 3
    }

    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        let mut residuals = self.values.clone();
        for (k, reach) in self.reach.iter().enumerate() {
            let (x, y, flux) = (params[3 * k], params[3 * k + 1], params[3 * k + 2]);
            for &i in reach {
                let (px, py) = self.pixels[i];
                residuals[i] -= flux * self.psf.evaluate(px - x, py - y);
            }
        }
        residuals
    }

    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64> {
        let mut jac = DMatrix::zeros(self.pixels.len(), self.num_params());
        for (k, reach) in self.reach.iter().enumerate() {
            let (x, y, flux) = (params[3 * k], params[3 * k + 1], params[3 * k + 2]);
            for &i in reach {
                let (dx, dy) = (self.pixels[i].0 - x, self.pixels[i].1 - y);
                let (gx, gy) = self.psf.gradient(dx, dy);
                jac[(i, 3 * k)] = -flux * gx;
                jac[(i, 3 * k + 1)] = -flux * gy;
                jac[(i, 3 * k + 2)] = self.psf.evaluate(dx, dy);
            }
        }
        jac
    }
}

/// Fit the positions and fluxes of `guesses` jointly over the union of their
/// `fit_shape × fit_shape` boxes in `data` (background already removed).
pub fn fit_group(
    data: ArrayView2<f64>,
    psf: &PsfModel,
    guesses: &[SourceGuess],
    fit_shape: usize,
    solver: &LevenbergMarquardt,
) -> Result<Vec<SourceGuess>> {
    if guesses.is_empty() {
        return Ok(Vec::new());
    }
    let problem = GroupProblem::new(data, psf, guesses, fit_shape);
    let report = solver.minimize(&problem, GroupProblem::initial(guesses))?;
    let p = report.params;
    Ok((0..guesses.len())
        .map(|k| SourceGuess {
            x: p[3 * k],
            y: p[3 * k + 1],
            flux: p[3 * k + 2],
        })
        .collect())
}

/// Fit every group in parallel; one record per source, ordered by index
/// into `guesses`.
fn fit_groups(
    data: ArrayView2<f64>,
    psf: &PsfModel,
    guesses: &[SourceGuess],
    groups: &[usize],
    fit_shape: usize,
    solver: &LevenbergMarquardt,
    iteration: usize,
) -> Result<Vec<FitRecord>> {
    let n_groups = groups
        .iter()
        .filter(|&&g| g != usize::MAX)
        .max()
        .map_or(0, |g| g + 1);
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); n_groups];
    let mut loners = Vec::new();
    for (i, &g) in groups.iter().enumerate() {
        if g == usize::MAX {
            loners.push(i);
        } else {
            members[g].push(i);
        }
    }
    if !loners.is_empty() {
        log::warn!("{} sources with non-finite positions skipped", loners.len());
    }

    let fitted: Vec<Vec<FitRecord>> = members
        .par_iter()
        .enumerate()
        .map(|(group_id, idx)| -> Result<Vec<FitRecord>> {
            let group: Vec<SourceGuess> = idx.iter().map(|&i| guesses[i]).collect();
            let result = fit_group(data, psf, &group, fit_shape, solver)?;
            Ok(idx
                .iter()
                .zip(result)
                .map(|(&i, fit)| FitRecord {
                    id: i,
                    group_id,
                    iter_detected: iteration,
                    x_0: guesses[i].x,
                    y_0: guesses[i].y,
                    flux_0: guesses[i].flux,
                    x_fit: fit.x,
                    y_fit: fit.y,
                    flux_fit: fit.flux,
                })
                .collect())
        })
        .collect::<Result<_>>()?;

    let mut records: Vec<FitRecord> = fitted.into_iter().flatten().collect();
    records.sort_by_key(|r| r.id);
    Ok(records)
}

fn solver(config: &Config) -> LevenbergMarquardt {
    LevenbergMarquardt::default().with_max_iterations(config.lm_max_iterations)
}

/// Subtract the fitted sources from `image`.
pub fn residual_image(image: ArrayView2<f64>, psf: &PsfModel, fits: &[FitRecord]) -> Array2<f64> {
    let mut residual = image.to_owned();
    let (rows, cols) = residual.dim();
    let extent = psf.shape_in_pixels() + 2;
    for fit in fits {
        if !(fit.x_fit.is_finite() && fit.y_fit.is_finite() && fit.flux_fit.is_finite()) {
            continue;
        }
        let (x0, x1) = box_range(fit.x_fit, extent, cols);
        let (y0, y1) = box_range(fit.y_fit, extent, rows);
        for r in y0..y1 {
            for c in x0..x1 {
                residual[[r, c]] -=
                    fit.flux_fit * psf.evaluate(c as f64 - fit.x_fit, r as f64 - fit.y_fit);
            }
        }
    }
    residual
}

/// PSF photometry of a whole image.
///
/// The sigma-clipped median is removed as background. Sources come from
/// `init_guesses` on the first pass when given, otherwise from the star
/// finder run with the image's detection threshold and the PSF's FWHM.
/// Each later pass (up to `photometry_iterations`) detects on the residual
/// left by the previous fits.
pub fn do_photometry(
    image: ArrayView2<f64>,
    psf: &PsfModel,
    config: &Config,
    init_guesses: Option<&[SourceRecord]>,
) -> Result<Vec<FitRecord>> {
    let (background, threshold) = detection_threshold(image, config)?;
    let fwhm = psf.fwhm_estimate()?;
    let fit_shape = config.fitshape.unwrap_or_else(|| psf.fit_shape());
    let crit_separation = config.separation_factor * fwhm;
    let finder = dao_finder(threshold, fwhm)?;
    let solver = solver(config);
    log::debug!("PSF fwhm {fwhm:.3} px, fit shape {fit_shape}, group radius {crit_separation:.3}");

    let mut residual = image.mapv(|v| v - background.median);
    let mut results: Vec<FitRecord> = Vec::new();
    let mut group_offset = 0;

    for iteration in 1..=config.photometry_iterations.max(1) {
        let guesses: Vec<SourceGuess> = match init_guesses {
            Some(sources) if iteration == 1 => sources
                .iter()
                .map(|s| SourceGuess {
                    x: s.x,
                    y: s.y,
                    flux: if s.flux.is_finite() && s.flux > 0.0 {
                        s.flux
                    } else {
                        aperture_flux(residual.view(), s.x, s.y, fit_shape)
                    },
                })
                .collect(),
            _ => find_candidates(&finder, residual.view())
                .iter()
                .map(|c| SourceGuess {
                    x: c.x,
                    y: c.y,
                    flux: aperture_flux(residual.view(), c.x, c.y, fit_shape),
                })
                .collect(),
        };
        if guesses.is_empty() {
            if iteration == 1 {
                log::warn!("no sources found for photometry");
            }
            break;
        }

        let positions: Vec<Vector2<f64>> =
            guesses.iter().map(|g| Vector2::new(g.x, g.y)).collect();
        let groups = group_sources(&positions, crit_separation);
        let mut fits = fit_groups(
            residual.view(),
            psf,
            &guesses,
            &groups,
            fit_shape,
            &solver,
            iteration,
        )?;
        let id_offset = results.len();
        let groups_this_pass = fits.iter().map(|f| f.group_id + 1).max().unwrap_or(0);
        let next_group_offset = group_offset + groups_this_pass;
        for fit in &mut fits {
            fit.id += id_offset;
            fit.group_id += group_offset;
        }
        group_offset = next_group_offset;
        log::debug!(
            "pass {iteration}: {} sources in {groups_this_pass} groups",
            fits.len()
        );

        residual = residual_image(residual.view(), psf, &fits);
        results.extend(fits);
    }

    Ok(results)
}

/// Fit each source alone at its catalogue position, without detection or
/// grouping.
pub fn fit_at_positions(
    image: ArrayView2<f64>,
    psf: &PsfModel,
    config: &Config,
    sources: &[SourceRecord],
) -> Result<Vec<FitRecord>> {
    let values: Vec<f64> = image.iter().copied().collect();
    let background = shared::algo::sigma_clipped_stats(&values, config.clip_sigma, 5)?.median;
    let data = image.mapv(|v| v - background);
    let fit_shape = config.fitshape.unwrap_or_else(|| psf.fit_shape());
    let solver = solver(config);

    sources
        .par_iter()
        .enumerate()
        .map(|(i, source)| {
            let guess = SourceGuess {
                x: source.x,
                y: source.y,
                flux: if source.flux.is_finite() && source.flux > 0.0 {
                    source.flux
                } else {
                    aperture_flux(data.view(), source.x, source.y, fit_shape)
                },
            };
            let fit = fit_group(data.view(), psf, &[guess], fit_shape, &solver)?;
            let fit = fit.first().copied().unwrap_or(guess);
            Ok(FitRecord {
                id: source.id.unwrap_or(i),
                group_id: i,
                iter_detected: 1,
                x_0: guess.x,
                y_0: guess.y,
                flux_0: guess.flux,
                x_fit: fit.x,
                y_fit: fit.y,
                flux_fit: fit.flux,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use simulator::render::add_gaussian_star;

    /// Sigma of a pixel-integrated Gaussian star of sigma 1.5
    fn star_sigma() -> f64 {
        (1.5f64 * 1.5 + 1.0 / 12.0).sqrt()
    }

    fn gaussian_psf(sigma: f64, oversampling: usize) -> PsfModel {
        let size = 25 * oversampling + 1;
        let c = (size as f64 - 1.0) / 2.0;
        let s = sigma * oversampling as f64;
        let data = Array2::from_shape_fn((size, size), |(r, col)| {
            let dx = col as f64 - c;
            let dy = r as f64 - c;
            (-(dx * dx + dy * dy) / (2.0 * s * s)).exp()
        });
        PsfModel::normalized(data, oversampling).unwrap()
    }

    fn config() -> Config {
        Config {
            fitshape: Some(11),
            ..Config::default()
        }
    }

    #[test]
    fn test_group_sources_chains_neighbours() {
        let positions = vec![
            Vector2::new(0.0, 0.0),
            Vector2::new(3.0, 0.0),
            Vector2::new(6.0, 0.0),
            Vector2::new(50.0, 50.0),
            Vector2::new(0.0, 4.0),
        ];
        let groups = group_sources(&positions, 3.5);
        assert_eq!(groups, vec![0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_group_sources_separation_is_strict() {
        let positions = vec![Vector2::new(0.0, 0.0), Vector2::new(3.0, 0.0)];
        assert_eq!(group_sources(&positions, 3.0), vec![0, 1]);
    }

    #[test]
    fn test_fit_group_recovers_blended_pair() {
        let psf = gaussian_psf(star_sigma(), 4);
        let mut image = Array2::zeros((60, 60));
        add_gaussian_star(&mut image, 28.3, 30.1, 5000.0, 1.5);
        add_gaussian_star(&mut image, 32.6, 29.4, 3000.0, 1.5);

        let guesses = [
            SourceGuess {
                x: 28.0,
                y: 30.0,
                flux: 4000.0,
            },
            SourceGuess {
                x: 33.0,
                y: 29.0,
                flux: 4000.0,
            },
        ];
        let solver = LevenbergMarquardt::default();
        let fits = fit_group(image.view(), &psf, &guesses, 11, &solver).unwrap();
        assert_abs_diff_eq!(fits[0].x, 28.3, epsilon = 0.05);
        assert_abs_diff_eq!(fits[0].y, 30.1, epsilon = 0.05);
        assert_abs_diff_eq!(fits[1].x, 32.6, epsilon = 0.05);
        assert_abs_diff_eq!(fits[0].flux, 5000.0, epsilon = 150.0);
        assert_abs_diff_eq!(fits[1].flux, 3000.0, epsilon = 100.0);
    }

    #[test]
    fn test_do_photometry_blind_and_residual() {
        let psf = gaussian_psf(star_sigma(), 4);
        let mut image = Array2::from_elem((80, 80), 20.0);
        add_gaussian_star(&mut image, 20.4, 25.7, 8000.0, 1.5);
        add_gaussian_star(&mut image, 55.2, 50.3, 6000.0, 1.5);

        let fits = do_photometry(image.view(), &psf, &config(), None).unwrap();
        assert_eq!(fits.len(), 2);
        assert_abs_diff_eq!(fits[0].x_fit, 20.4, epsilon = 0.05);
        assert_abs_diff_eq!(fits[1].y_fit, 50.3, epsilon = 0.05);
        assert_ne!(fits[0].group_id, fits[1].group_id);
        assert!(fits.iter().all(|f| f.iter_detected == 1));

        let residual = residual_image(image.mapv(|v| v - 20.0).view(), &psf, &fits);
        let max_residual = residual.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(max_residual < 20.0, "max residual {max_residual}");
    }

    #[test]
    fn test_do_photometry_second_pass_finds_missed_star() {
        let psf = gaussian_psf(star_sigma(), 4);
        let mut image = Array2::from_elem((64, 64), 30.0);
        add_gaussian_star(&mut image, 30.3, 30.6, 6000.0, 1.5);
        add_gaussian_star(&mut image, 39.4, 31.2, 2000.0, 1.5);

        // The faint star is not in the catalogue, so only the residual shows it
        let catalogue = [SourceRecord::from_flux(Some(0), 30.0, 31.0, 5000.0)];
        let config = Config {
            photometry_iterations: 2,
            separation_factor: 0.5,
            ..config()
        };
        let fits = do_photometry(image.view(), &psf, &config, Some(&catalogue)).unwrap();
        assert_eq!(fits.len(), 2, "{fits:?}");

        let (bright, faint) = (fits[0], fits[1]);
        assert_eq!(bright.iter_detected, 1);
        assert_eq!(faint.iter_detected, 2);
        assert_abs_diff_eq!(bright.x_fit, 30.3, epsilon = 0.1);
        assert_abs_diff_eq!(faint.x_fit, 39.4, epsilon = 0.1);
        assert_abs_diff_eq!(faint.y_fit, 31.2, epsilon = 0.1);
        assert_abs_diff_eq!(faint.flux_fit, 2000.0, epsilon = 150.0);

        assert_ne!(bright.id, faint.id);
        assert_ne!(bright.group_id, faint.group_id);
    }

    #[test]
    fn test_do_photometry_empty_image() {
        let psf = gaussian_psf(1.5, 2);
        let image = Array2::from_elem((40, 40), 5.0);
        let fits = do_photometry(image.view(), &psf, &config(), None).unwrap();
        assert!(fits.is_empty());
    }

    #[test]
    fn test_fit_at_positions_keeps_ids() {
        let psf = gaussian_psf(star_sigma(), 1);
        let mut image = Array2::from_elem((50, 50), 10.0);
        add_gaussian_star(&mut image, 24.8, 25.3, 10000.0, 1.5);
        let sources = [SourceRecord::from_flux(Some(7), 25.0, 25.0, 9000.0)];

        let fits = fit_at_positions(image.view(), &psf, &config(), &sources).unwrap();
        assert_eq!(fits.len(), 1);
        assert_eq!(fits[0].id, 7);
        assert_abs_diff_eq!(fits[0].x_fit, 24.8, epsilon = 0.05);
        assert_abs_diff_eq!(fits[0].y_fit, 25.3, epsilon = 0.05);
        // Bilinear interpolation of a pixel-sampled model is slightly too wide
        assert_abs_diff_eq!(fits[0].flux_fit, 10000.0, epsilon = 500.0);
    }
}
