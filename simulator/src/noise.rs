//! Detector noise for synthetic images.
//!
//! Noise fields are generated in parallel row chunks. Each chunk draws from
//! its own `ChaCha8Rng` seeded from the base seed and the chunk index, so a
//! given seed produces the same image regardless of thread count.

use ndarray::{Array2, ArrayViewMut2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal, Poisson};
use rayon::prelude::*;

const ROWS_PER_CHUNK: usize = 64;

/// Mean counts above which Poisson draws use the normal approximation
const POISSON_NORMAL_CUTOVER: f64 = 1e4;

/// Run `f` over row chunks of `array` in parallel with per-chunk RNGs.
fn process_rows_in_parallel_chunks<F>(array: &mut Array2<f64>, seed: u64, f: F)
where
    F: Fn(ArrayViewMut2<f64>, &mut ChaCha8Rng) + Sync,
{
    let chunks: Vec<_> = array
        .axis_chunks_iter_mut(Axis(0), ROWS_PER_CHUNK)
        .enumerate()
        .collect();
    chunks.into_par_iter().for_each(|(index, chunk)| {
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(index as u64));
        f(chunk, &mut rng);
    });
}

/// Deterministic normal field `N(mean, std_dev)` of shape `(rows, cols)`.
pub fn simple_normal_array(
    size: (usize, usize),
    mean: f64,
    std_dev: f64,
    seed: u64,
) -> Array2<f64> {
    let mut out = Array2::zeros(size);
    if let Ok(dist) = Normal::new(mean, std_dev) {
        process_rows_in_parallel_chunks(&mut out, seed, |mut chunk, rng| {
            chunk.iter_mut().for_each(|v| *v = dist.sample(rng));
        });
    } else {
        out.fill(mean);
    }
    out
}

/// Replace each pixel by a Poisson draw with that pixel as the mean.
///
/// Non-positive or non-finite means become zero.
pub fn apply_poisson_noise(mean_image: &mut Array2<f64>, seed: u64) {
    process_rows_in_parallel_chunks(mean_image, seed, |mut chunk, rng| {
        chunk.iter_mut().for_each(|pixel| {
            let mean = *pixel;
            *pixel = if !(mean > 0.0) || !mean.is_finite() {
                0.0
            } else if mean < POISSON_NORMAL_CUTOVER {
                Poisson::new(mean).map_or(0.0, |p| p.sample(rng))
            } else {
                Normal::new(mean, mean.sqrt()).map_or(mean, |n| n.sample(rng).max(0.0))
            };
        });
    });
}

/// Add zero-mean Gaussian read noise of the given RMS.
pub fn add_read_noise(image: &mut Array2<f64>, read_noise: f64, seed: u64) {
    if !(read_noise > 0.0) {
        return;
    }
    *image += &simple_normal_array(image.dim(), 0.0, read_noise, seed);
}

/// Add a flat sky `background`, apply shot noise to the total and add read noise.
///
/// The background level stays in the returned image; callers estimate and
/// subtract it the same way they would for a real frame.
pub fn add_noise(image: &mut Array2<f64>, background: f64, read_noise: f64, seed: u64) {
    image.mapv_inplace(|v| v + background);
    apply_poisson_noise(image, seed);
    // Offset the read-noise stream so it does not reuse the shot-noise chunk seeds
    add_read_noise(image, read_noise, seed ^ 0x5EED_0F_4EAD);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_simple_normal_array_statistics() {
        let noise = simple_normal_array((200, 200), 10.0, 2.0, 42);
        assert_eq!(noise.dim(), (200, 200));
        assert_relative_eq!(noise.mean().unwrap(), 10.0, epsilon = 0.05);
        assert_relative_eq!(noise.std(0.0), 2.0, epsilon = 0.05);
    }

    #[test]
    fn test_deterministic_for_seed() {
        let a = simple_normal_array((130, 7), 0.0, 1.0, 5);
        let b = simple_normal_array((130, 7), 0.0, 1.0, 5);
        let c = simple_normal_array((130, 7), 0.0, 1.0, 6);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_poisson_mean_and_variance() {
        let mut image = Array2::from_elem((200, 200), 25.0);
        apply_poisson_noise(&mut image, 3);
        assert_relative_eq!(image.mean().unwrap(), 25.0, epsilon = 0.1);
        assert_relative_eq!(image.var(0.0), 25.0, epsilon = 0.8);
        assert!(image.iter().all(|v| v.fract() == 0.0 && *v >= 0.0));
    }

    #[test]
    fn test_poisson_zero_and_negative_means() {
        let mut image = Array2::from_shape_vec((1, 3), vec![0.0, -4.0, f64::NAN]).unwrap();
        apply_poisson_noise(&mut image, 1);
        assert!(image.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_add_noise_keeps_background() {
        let mut image = Array2::zeros((128, 128));
        add_noise(&mut image, 100.0, 5.0, 9);
        let mean = image.mean().unwrap();
        assert_relative_eq!(mean, 100.0, epsilon = 0.35);
        // Shot noise (variance 100) plus read noise (variance 25)
        assert_relative_eq!(image.var(0.0), 125.0, epsilon = 6.0);
    }
}
