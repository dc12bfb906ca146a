//! Robust statistics: median, MAD and sigma-clipped estimators.
//!
//! Sigma clipping follows the usual astronomical convention: values further
//! than `sigma` standard deviations from the median are rejected and the
//! statistics are recomputed until nothing more is clipped or the iteration
//! budget runs out. Non-finite values never take part.

use thiserror::Error;

/// For a normal distribution, σ ≈ 1.4826 × MAD.
pub const MAD_TO_SIGMA: f64 = 1.482_602_218_505_602;

/// Errors raised by the statistics helpers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    #[error("cannot compute statistics of an empty sample ({0} values, none finite)")]
    Empty(usize),
    #[error("sigma clipping rejected every value")]
    AllClipped,
}

/// Result of [`sigma_clipped_stats`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClippedStats {
    pub mean: f64,
    pub median: f64,
    /// Population standard deviation of the retained values
    pub std: f64,
    /// Number of values that survived clipping
    pub retained: usize,
}

fn finite_values(values: &[f64]) -> Result<Vec<f64>, StatsError> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return Err(StatsError::Empty(values.len()));
    }
    Ok(finite)
}

/// Median of a non-empty buffer, reordering it in place.
fn median_in_place(data: &mut [f64]) -> f64 {
    debug_assert!(!data.is_empty());
    let len = data.len();
    let mid = len / 2;
    let (left, upper, _) = data.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    let upper = *upper;
    if len % 2 == 1 {
        upper
    } else {
        let lower = left.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        0.5 * (lower + upper)
    }
}

fn mean_and_std(data: &[f64]) -> (f64, f64) {
    let n = data.len() as f64;
    let mean = data.iter().sum::<f64>() / n;
    let variance = data.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Median of the finite values in `values`.
///
/// For even-length input the two middle values are averaged.
pub fn median(values: &[f64]) -> Result<f64, StatsError> {
    let mut finite = finite_values(values)?;
    Ok(median_in_place(&mut finite))
}

/// Standard deviation estimated from the median absolute deviation.
pub fn mad_std(values: &[f64]) -> Result<f64, StatsError> {
    let mut finite = finite_values(values)?;
    let center = median_in_place(&mut finite);
    for v in finite.iter_mut() {
        *v = (*v - center).abs();
    }
    Ok(median_in_place(&mut finite) * MAD_TO_SIGMA)
}

/// Iteratively clip `values` about the median and return the surviving sample.
fn clip(values: &[f64], sigma: f64, max_iters: usize) -> Result<Vec<f64>, StatsError> {
    let mut kept = finite_values(values)?;
    let mut scratch = Vec::with_capacity(kept.len());

    for _ in 0..max_iters {
        scratch.clear();
        scratch.extend_from_slice(&kept);
        let center = median_in_place(&mut scratch);
        let (_, std) = mean_and_std(&kept);

        let bound = sigma * std;
        let before = kept.len();
        kept.retain(|v| (v - center).abs() <= bound);

        if kept.is_empty() {
            return Err(StatsError::AllClipped);
        }
        if kept.len() == before {
            break;
        }
    }

    Ok(kept)
}

/// Sigma-clipped mean, median and standard deviation.
///
/// # Arguments
/// * `values` - Sample, typically every pixel of an image
/// * `sigma` - Clipping threshold in standard deviations
/// * `max_iters` - Maximum number of clipping passes (5 is customary)
pub fn sigma_clipped_stats(
    values: &[f64],
    sigma: f64,
    max_iters: usize,
) -> Result<ClippedStats, StatsError> {
    let mut kept = clip(values, sigma, max_iters)?;
    let (mean, std) = mean_and_std(&kept);
    let retained = kept.len();
    let median = median_in_place(&mut kept);

    Ok(ClippedStats {
        mean,
        median,
        std,
        retained,
    })
}

/// Median of the values that survive sigma clipping, `None` for an empty
/// or fully rejected sample.
pub fn sigma_clipped_median(values: &[f64], sigma: f64, max_iters: usize) -> Option<f64> {
    let mut kept = clip(values, sigma, max_iters).ok()?;
    Some(median_in_place(&mut kept))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]).unwrap(), 2.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]).unwrap(), 2.5);
    }

    #[test]
    fn test_median_ignores_nan() {
        assert_eq!(median(&[f64::NAN, 5.0, 1.0, 3.0]).unwrap(), 3.0);
        assert_eq!(median(&[f64::NAN]), Err(StatsError::Empty(1)));
        assert_eq!(median(&[]), Err(StatsError::Empty(0)));
    }

    #[test]
    fn test_mad_std_of_constant_is_zero() {
        assert_eq!(mad_std(&[2.0; 10]).unwrap(), 0.0);
    }

    #[test]
    fn test_sigma_clip_rejects_outliers() {
        let mut values = vec![10.0; 99];
        values.push(1.0e6);

        let stats = sigma_clipped_stats(&values, 3.0, 5).unwrap();
        assert_eq!(stats.retained, 99);
        assert_relative_eq!(stats.mean, 10.0);
        assert_relative_eq!(stats.median, 10.0);
        assert_relative_eq!(stats.std, 0.0);
    }

    #[test]
    fn test_sigma_clip_recovers_gaussian_background() {
        use rand_distr::{Distribution, Normal};

        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let normal = Normal::new(100.0, 5.0).unwrap();
        let mut values: Vec<f64> = (0..20_000).map(|_| normal.sample(&mut rng)).collect();
        // Bright "stars" that must not bias the background
        values.extend(std::iter::repeat(5_000.0).take(200));

        let stats = sigma_clipped_stats(&values, 3.0, 5).unwrap();
        assert_relative_eq!(stats.median, 100.0, epsilon = 0.3);
        assert_relative_eq!(stats.std, 5.0, epsilon = 0.3);
    }

    #[test]
    fn test_sigma_clipped_median_empty() {
        assert_eq!(sigma_clipped_median(&[], 3.0, 10), None);
        assert_eq!(sigma_clipped_median(&[1.0, 2.0, 3.0], 3.0, 10), Some(2.0));
    }
}
