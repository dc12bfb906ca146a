//! Star-candidate detection and star cut-outs.
//!
//! Detection is DAOFIND from `starfield`; this module picks its settings,
//! turns its sources into [`Candidate`] rows and filters them.

use meter_math::KdTree;
use nalgebra::Vector2;
use ndarray::{Array2, ArrayView2};
use shared::algo::{sigma_clipped_stats, ClippedStats};
use shared::image_proc::extract_centered;
use shared::ImageSize;
use starfield::image::starfinders::{DAOStarFinder, DAOStarFinderConfig, StellarSource};

use crate::config::Config;
use crate::epsf::StarCutout;
use crate::table::Candidate;
use crate::{PhotometryError, Result};

/// Clipping passes for the background statistics
const CLIP_ITERS: usize = 5;

/// DAOFIND detector for sources of width `fwhm` brighter than `threshold`.
///
/// Peaks whose kernel footprint leaves the image are skipped, so a flat
/// background does not turn into detections along the border.
pub fn dao_finder(threshold: f64, fwhm: f64) -> Result<DAOStarFinder> {
    if !(fwhm > 0.0) {
        return Err(PhotometryError::InvalidConfig(format!(
            "finder fwhm must be positive, got {fwhm}"
        )));
    }
    if !threshold.is_finite() {
        return Err(PhotometryError::InvalidConfig(
            "finder threshold must be finite".into(),
        ));
    }
    let config = DAOStarFinderConfig {
        threshold,
        fwhm,
        ratio: 1.0,
        theta: 0.0,
        sigma_radius: 1.5,
        sharpness: 0.2..=1.0,
        roundness: -1.0..=1.0,
        exclude_border: true,
        brightest: None,
        peakmax: None,
        min_separation: 1.0,
    };
    DAOStarFinder::new(config)
        .map_err(|e| PhotometryError::InvalidConfig(format!("DAO star finder creation failed: {e}")))
}

/// Run `finder` over `image`, ordered by position (row-major) with ids
/// assigned in that order.
pub fn find_candidates(finder: &DAOStarFinder, image: ArrayView2<f64>) -> Vec<Candidate> {
    let owned: Array2<f64> = image.to_owned();
    let mut candidates: Vec<Candidate> = finder
        .find_stars(&owned, None)
        .iter()
        .map(|star| {
            let (x, y) = star.get_centroid();
            Candidate {
                id: star.id(),
                x,
                y,
                peak: star.peak,
                flux: star.flux(),
                sharpness: star.sharpness,
                roundness1: star.roundness1,
                roundness2: star.roundness2,
                mag: star.mag(),
            }
        })
        .filter(|c| c.x.is_finite() && c.y.is_finite())
        .collect();
    candidates.sort_by(|a, b| a.y.total_cmp(&b.y).then(a.x.total_cmp(&b.x)));
    for (id, candidate) in candidates.iter_mut().enumerate() {
        candidate.id = id;
    }
    log::debug!("DAOFIND: {} sources", candidates.len());
    candidates
}


/// Robust background statistics and the detection threshold
/// `median + threshold_factor · std`.
pub fn detection_threshold(image: ArrayView2<f64>, config: &Config) -> Result<(ClippedStats, f64)> {
    let values: Vec<f64> = image.iter().copied().collect();
    let stats = sigma_clipped_stats(&values, config.clip_sigma, CLIP_ITERS)?;
    let threshold = stats.median + config.threshold_factor * stats.std;
    log::debug!(
        "background median {:.3}, std {:.3}, threshold {:.3}",
        stats.median,
        stats.std,
        threshold
    );
    Ok((stats, threshold))
}

/// Keep candidates with `half < x < width - half` and likewise for `y`,
/// where `half = box_size / 2`.
pub fn cut_edges(candidates: Vec<Candidate>, box_size: usize, size: ImageSize) -> Vec<Candidate> {
    let half = box_size as f64 / 2.0;
    candidates
        .into_iter()
        .filter(|c| size.contains_with_margin(c.x, c.y, half))
        .collect()
}

/// Drop candidates whose nearest neighbour is at or closer than `cutoff_dist`.
///
/// A lone candidate has no neighbour and is always kept.
pub fn cut_close_stars(candidates: Vec<Candidate>, cutoff_dist: f64) -> Vec<Candidate> {
    let points: Vec<Vector2<f64>> = candidates.iter().map(|c| Vector2::new(c.x, c.y)).collect();
    let tree = KdTree::build(&points);
    candidates
        .into_iter()
        .zip(&points)
        .filter(|(_, p)| {
            // The nearest hit is the candidate itself
            let nearest = tree
                .k_nearest(**p, 2)
                .get(1)
                .map_or(f64::INFINITY, |&(_, d)| d);
            nearest > cutoff_dist
        })
        .map(|(c, _)| c)
        .collect()
}

/// Cut `size × size` stamps of `image` around each candidate.
///
/// Candidates whose stamp would leave the image are skipped. The stamp's
/// flux is its sum.
pub fn extract_stars(
    image: ArrayView2<f64>,
    candidates: &[Candidate],
    size: usize,
) -> Vec<StarCutout> {
    let stars: Vec<StarCutout> = candidates
        .iter()
        .filter_map(|c| {
            let cut = extract_centered(image, c.x, c.y, size)?;
            let cutout_center = cut.to_local(c.x, c.y);
            Some(StarCutout {
                id: c.id,
                flux: cut.data.sum(),
                data: cut.data,
                x_origin: cut.x_origin,
                y_origin: cut.y_origin,
                cutout_center,
            })
        })
        .collect();
    if stars.len() < candidates.len() {
        log::debug!(
            "{} of {} candidates skipped at the image border",
            candidates.len() - stars.len(),
            candidates.len()
        );
    }
    stars
}

/// Candidates for EPSF building and the background they were measured against.
#[derive(Debug, Clone)]
pub struct StarGuesses {
    pub stars: Vec<StarCutout>,
    pub candidates: Vec<Candidate>,
    pub background: ClippedStats,
}

/// Detect bright candidates, filter them and cut background-subtracted stamps.
///
/// An empty result is not an error here; the EPSF builders reject it.
pub fn make_stars_guess(image: ArrayView2<f64>, config: &Config) -> Result<StarGuesses> {
    let (background, threshold) = detection_threshold(image, config)?;
    let finder = dao_finder(threshold, config.fwhm_guess)?;

    let found = find_candidates(&finder, image);
    let detected = found.len();
    let mut candidates = cut_edges(found, config.cutout_size, ImageSize::of(&image));
    if let Some(cutoff) = config.cutoff_dist {
        candidates = cut_close_stars(candidates, cutoff);
    }
    log::debug!(
        "{detected} detections, {} candidates after filtering",
        candidates.len()
    );
    if candidates.is_empty() {
        log::warn!("no star candidates found");
    }

    let no_background = image.mapv(|v| v - background.median);
    let stars = extract_stars(no_background.view(), &candidates, config.cutout_size);
    Ok(StarGuesses {
        stars,
        candidates,
        background,
    })
}
