//! Sub-pixel sampling by bilinear interpolation.

use ndarray::{Array2, ArrayView2};

/// Sample `data` at the fractional position `(x, y)` (column, row).
///
/// Positions are in pixel-center coordinates. Samples outside
/// `[0, cols - 1] × [0, rows - 1]` return `0.0`.
pub fn sample_bilinear(data: ArrayView2<f64>, x: f64, y: f64) -> f64 {
    let (rows, cols) = data.dim();
    if rows == 0 || cols == 0 || !x.is_finite() || !y.is_finite() {
        return 0.0;
    }
    let max_x = (cols - 1) as f64;
    let max_y = (rows - 1) as f64;
    if x < 0.0 || y < 0.0 || x > max_x || y > max_y {
        return 0.0;
    }

    let x0 = x.floor().min((cols.saturating_sub(2)) as f64) as usize;
    let y0 = y.floor().min((rows.saturating_sub(2)) as f64) as usize;
    let x1 = (x0 + 1).min(cols - 1);
    let y1 = (y0 + 1).min(rows - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let top = data[[y0, x0]] * (1.0 - fx) + data[[y0, x1]] * fx;
    let bottom = data[[y1, x0]] * (1.0 - fx) + data[[y1, x1]] * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Shift an image by `(dx, dy)` pixels: `out(x, y) = in(x - dx, y - dy)`.
///
/// Regions shifted in from outside the frame are zero.
pub fn shift_bilinear(data: ArrayView2<f64>, dx: f64, dy: f64) -> Array2<f64> {
    Array2::from_shape_fn(data.dim(), |(r, c)| {
        sample_bilinear(data, c as f64 - dx, r as f64 - dy)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr2;

    #[test]
    fn test_sample_on_grid_and_between() {
        let data = arr2(&[[0.0, 1.0, 2.0], [10.0, 11.0, 12.0]]);
        assert_relative_eq!(sample_bilinear(data.view(), 1.0, 1.0), 11.0);
        assert_relative_eq!(sample_bilinear(data.view(), 0.5, 0.5), 5.5);
        assert_relative_eq!(sample_bilinear(data.view(), 2.0, 1.0), 12.0);
        assert_eq!(sample_bilinear(data.view(), -0.1, 0.0), 0.0);
        assert_eq!(sample_bilinear(data.view(), 0.0, 1.5), 0.0);
    }

    #[test]
    fn test_shift_integer() {
        let mut data = Array2::<f64>::zeros((5, 5));
        data[[2, 2]] = 1.0;
        let shifted = shift_bilinear(data.view(), 1.0, -1.0);
        assert_relative_eq!(shifted[[1, 3]], 1.0);
        assert_relative_eq!(shifted.sum(), 1.0);
    }

    #[test]
    fn test_shift_half_pixel_splits_flux() {
        let mut data = Array2::<f64>::zeros((5, 5));
        data[[2, 2]] = 1.0;
        let shifted = shift_bilinear(data.view(), 0.5, 0.0);
        assert_relative_eq!(shifted[[2, 2]], 0.5);
        assert_relative_eq!(shifted[[2, 3]], 0.5);
    }
}
