//! 2D convolution implementation for image processing
//!
//! Kernels are applied without flipping (correlation). Every kernel used in
//! this workspace is point symmetric, where the two operations coincide.

use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView2, Axis};

/// Options for controlling the convolution operation
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvolveOptions {
    pub mode: ConvolveMode,
}

/// Mode for handling edges in convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConvolveMode {
    /// Only compute output where input and kernel fully overlap
    Valid,
    /// Use zero-padding to maintain input size
    #[default]
    Same,
}

/// Perform 2D convolution of an image with a kernel
///
/// # Arguments
/// * `image` - Input image as a 2D array
/// * `kernel` - Convolution kernel, odd sized for `Same` mode
/// * `options` - Optional configuration (defaults to `Same`)
///
/// # Returns
/// * Result of the convolution as a 2D array
pub fn convolve2d(
    image: &ArrayView2<f64>,
    kernel: &ArrayView2<f64>,
    options: Option<ConvolveOptions>,
) -> Array2<f64> {
    let options = options.unwrap_or_default();

    let (img_rows, img_cols) = image.dim();
    let (ker_rows, ker_cols) = kernel.dim();

    let (out_rows, out_cols) = match options.mode {
        ConvolveMode::Valid => (
            (img_rows + 1).saturating_sub(ker_rows),
            (img_cols + 1).saturating_sub(ker_cols),
        ),
        ConvolveMode::Same => (img_rows, img_cols),
    };

    if out_rows == 0 || out_cols == 0 || ker_rows == 0 || ker_cols == 0 {
        return Array2::zeros((out_rows, out_cols));
    }

    // Offset of the kernel origin relative to the output pixel
    let (row_off, col_off) = match options.mode {
        ConvolveMode::Valid => (0isize, 0isize),
        ConvolveMode::Same => ((ker_rows / 2) as isize, (ker_cols / 2) as isize),
    };

    let mut output = Array2::zeros((out_rows, out_cols));
    output
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut row)| {
            for (j, out) in row.iter_mut().enumerate() {
                let mut sum = 0.0;
                for ki in 0..ker_rows {
                    let y = i as isize + ki as isize - row_off;
                    if y < 0 || y >= img_rows as isize {
                        continue;
                    }
                    for kj in 0..ker_cols {
                        let x = j as isize + kj as isize - col_off;
                        if x < 0 || x >= img_cols as isize {
                            continue;
                        }
                        sum += image[[y as usize, x as usize]] * kernel[[ki, kj]];
                    }
                }
                *out = sum;
            }
        });

    output
}

/// Create a normalized 2D Gaussian kernel of `size × size` with the given sigma.
///
/// `size` is rounded up to the next odd number so the kernel has a center pixel.
pub fn gaussian_kernel(size: usize, sigma: f64) -> Array2<f64> {
    let size = if size % 2 == 0 { size + 1 } else { size };
    let center = (size / 2) as f64;
    let two_sigma_sq = 2.0 * sigma * sigma;

    let mut kernel = Array2::from_shape_fn((size, size), |(i, j)| {
        let dy = i as f64 - center;
        let dx = j as f64 - center;
        (-(dx * dx + dy * dy) / two_sigma_sq).exp()
    });

    let sum = kernel.sum();
    if sum > 0.0 {
        kernel /= sum;
    }
    kernel
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr2;

    #[test]
    fn test_identity_kernel_same_mode() {
        let image = arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]]);
        let kernel = arr2(&[[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]]);

        let result = convolve2d(&image.view(), &kernel.view(), None);
        assert_eq!(result, image);
    }

    #[test]
    fn test_valid_mode_shape_and_values() {
        let image = Array2::<f64>::ones((5, 4));
        let kernel = Array2::<f64>::ones((3, 3));

        let result = convolve2d(
            &image.view(),
            &kernel.view(),
            Some(ConvolveOptions {
                mode: ConvolveMode::Valid,
            }),
        );
        assert_eq!(result.dim(), (3, 2));
        assert!(result.iter().all(|&v| v == 9.0));
    }

    #[test]
    fn test_same_mode_zero_pads_edges() {
        let image = Array2::<f64>::ones((4, 4));
        let kernel = Array2::<f64>::ones((3, 3));

        let result = convolve2d(&image.view(), &kernel.view(), None);
        assert_eq!(result[[0, 0]], 4.0);
        assert_eq!(result[[0, 1]], 6.0);
        assert_eq!(result[[1, 1]], 9.0);
    }

    #[test]
    fn test_gaussian_kernel_normalized_and_symmetric() {
        let kernel = gaussian_kernel(4, 1.0);
        assert_eq!(kernel.dim(), (5, 5));
        assert_relative_eq!(kernel.sum(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(kernel[[0, 1]], kernel[[1, 0]]);
        assert_relative_eq!(kernel[[4, 3]], kernel[[0, 1]]);
        assert!(kernel[[2, 2]] > kernel[[2, 1]]);
    }
}
