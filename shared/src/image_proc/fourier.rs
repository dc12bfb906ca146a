//! Band-limited upsampling of small images.
//!
//! The input is transformed once with a 2D FFT and the trigonometric
//! interpolant is then evaluated on an arbitrary regular grid through two
//! small DFT matrices, so the output can be both finer than the input and
//! offset from it by a fractional amount.

use ndarray::{Array2, ArrayView2, Axis};
use num_complex::Complex64;
use rustfft::FftPlanner;
use std::f64::consts::PI;

/// In-place 2D forward FFT over rows and then columns.
fn fft_2d(data: &mut Array2<Complex64>) {
    let (rows, cols) = data.dim();
    let mut planner = FftPlanner::<f64>::new();

    let row_fft = planner.plan_fft_forward(cols);
    let mut buffer = vec![Complex64::new(0.0, 0.0); cols.max(rows)];
    for mut row in data.axis_iter_mut(Axis(0)) {
        buffer[..cols].iter_mut().zip(row.iter()).for_each(|(b, &v)| *b = v);
        row_fft.process(&mut buffer[..cols]);
        row.iter_mut().zip(buffer[..cols].iter()).for_each(|(v, &b)| *v = b);
    }

    let col_fft = planner.plan_fft_forward(rows);
    for mut col in data.axis_iter_mut(Axis(1)) {
        buffer[..rows].iter_mut().zip(col.iter()).for_each(|(b, &v)| *b = v);
        col_fft.process(&mut buffer[..rows]);
        col.iter_mut().zip(buffer[..rows].iter()).for_each(|(v, &b)| *v = b);
    }
}

/// Signed frequency of FFT bin `k` for a transform of length `n`.
fn signed_frequency(k: usize, n: usize) -> f64 {
    if k <= n / 2 {
        k as f64
    } else {
        k as f64 - n as f64
    }
}

/// Inverse DFT matrix sampling the interpolant at `positions` (in input pixels).
fn sampling_matrix(positions: &[f64], n: usize) -> Array2<Complex64> {
    Array2::from_shape_fn((positions.len(), n), |(p, k)| {
        // The Nyquist bin of an even transform is split between the +/- halves;
        // keeping only its cosine part makes the interpolant real.
        if n % 2 == 0 && k == n / 2 {
            return Complex64::new((PI * positions[p]).cos(), 0.0);
        }
        let phase = 2.0 * PI * signed_frequency(k, n) * positions[p] / n as f64;
        Complex64::new(phase.cos(), phase.sin())
    })
}

/// Regular output grid of `n_out` samples spaced `1 / factor` and centered on `center`.
fn output_positions(center: f64, n_out: usize, factor: f64) -> Vec<f64> {
    let mid = (n_out as f64 - 1.0) / 2.0;
    (0..n_out)
        .map(|p| center + (p as f64 - mid) / factor)
        .collect()
}

/// Upsample `image` by `factor` with the band-limited interpolant.
///
/// The output has `shape` (rows, cols) and its central sample (at
/// `(n - 1) / 2` along each axis) lands on `(center_x, center_y)` of the
/// input, in input pixel coordinates. Samples are spaced `1 / factor`
/// input pixels apart. Values are scaled so that the flux per input pixel
/// is preserved, i.e. the output sum is close to `factor² × input sum`
/// when the grid covers the source.
pub fn upsample_image(
    image: ArrayView2<f64>,
    factor: usize,
    center_x: f64,
    center_y: f64,
    shape: (usize, usize),
) -> Array2<f64> {
    let (rows, cols) = image.dim();
    if rows == 0 || cols == 0 || factor == 0 {
        return Array2::zeros(shape);
    }

    let mut spectrum = image.mapv(|v| Complex64::new(v, 0.0));
    fft_2d(&mut spectrum);

    let ys = output_positions(center_y, shape.0, factor as f64);
    let xs = output_positions(center_x, shape.1, factor as f64);
    let ey = sampling_matrix(&ys, rows);
    let ex = sampling_matrix(&xs, cols);

    let sampled = ey.dot(&spectrum).dot(&ex.t());
    let norm = (rows * cols) as f64;
    sampled.mapv(|c| c.re / norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn smooth_blob(n: usize, cx: f64, cy: f64, sigma: f64) -> Array2<f64> {
        Array2::from_shape_fn((n, n), |(r, c)| {
            let dx = c as f64 - cx;
            let dy = r as f64 - cy;
            (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
        })
    }

    #[test]
    fn test_factor_one_reproduces_input() {
        let image = smooth_blob(9, 4.0, 4.0, 1.5);
        let out = upsample_image(image.view(), 1, 4.0, 4.0, (9, 9));
        for (a, b) in out.iter().zip(image.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_integer_positions_on_fine_grid() {
        let image = smooth_blob(16, 7.5, 8.0, 2.0);
        let out = upsample_image(image.view(), 4, 7.0, 8.0, (33, 33));
        // Sample 16 sits on (7, 8); every fourth sample lands on an input pixel
        assert_relative_eq!(out[[16, 16]], image[[8, 7]], epsilon = 1e-9);
        assert_relative_eq!(out[[20, 12]], image[[9, 6]], epsilon = 1e-9);
        assert_relative_eq!(out[[8, 24]], image[[6, 9]], epsilon = 1e-9);
    }

    #[test]
    fn test_half_pixel_interpolation_of_smooth_source() {
        let image = smooth_blob(24, 12.0, 12.0, 2.5);
        let out = upsample_image(image.view(), 2, 12.0, 12.0, (5, 5));
        // Sample 3 along x sits on x = 12.5
        let expected = (-(0.5f64 * 0.5) / (2.0 * 2.5 * 2.5)).exp();
        assert_relative_eq!(out[[2, 3]], expected, epsilon = 1e-4);
    }

    #[test]
    fn test_shift_moves_peak() {
        let image = smooth_blob(21, 10.0, 10.0, 2.0);
        let out = upsample_image(image.view(), 4, 11.0, 10.0, (41, 41));
        let (mut best, mut best_idx) = (f64::MIN, (0, 0));
        for ((r, c), &v) in out.indexed_iter() {
            if v > best {
                best = v;
                best_idx = (r, c);
            }
        }
        // Input peak (10, 10) is one input pixel left of the requested center
        assert_eq!(best_idx, (20, 16));
        assert_relative_eq!(best, 1.0, epsilon = 1e-3);
    }
}
