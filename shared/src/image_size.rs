//! Image dimensions and bounds checks

use ndarray::ArrayBase;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Width and height of a frame in pixels.
///
/// Arrays are indexed `[[row, col]]`, so an `ImageSize` maps to an ndarray
/// shape of `(height, width)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: usize,
    pub height: usize,
}

impl ImageSize {
    pub fn from_width_height(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Size of a 2D array, reading its `(rows, cols)` shape.
    pub fn of<S, D>(array: &ArrayBase<S, D>) -> Self
    where
        S: ndarray::Data,
        D: ndarray::Dimension,
    {
        let shape = array.shape();
        let height = shape.first().copied().unwrap_or(0);
        let width = shape.get(1).copied().unwrap_or(0);
        Self { width, height }
    }

    /// Shape tuple `(rows, cols)` for constructing arrays
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Pixel-center coordinate of the middle of the frame
    pub fn center(&self) -> (f64, f64) {
        (
            (self.width as f64 - 1.0) / 2.0,
            (self.height as f64 - 1.0) / 2.0,
        )
    }

    /// True when `(x, y)` is strictly further than `margin` from every edge.
    ///
    /// Satisfied iff `margin < x < width - margin` and likewise for `y`.
    pub fn contains_with_margin(&self, x: f64, y: f64, margin: f64) -> bool {
        x > margin
            && x < self.width as f64 - margin
            && y > margin
            && y < self.height as f64 - margin
    }
}

impl From<(usize, usize)> for ImageSize {
    /// Build from `(width, height)`.
    fn from(dimensions: (usize, usize)) -> Self {
        Self::from_width_height(dimensions.0, dimensions.1)
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_of_array_uses_row_major_shape() {
        let arr = Array2::<f64>::zeros((30, 40));
        let size = ImageSize::of(&arr);
        assert_eq!(size.width, 40);
        assert_eq!(size.height, 30);
        assert_eq!(size.shape(), (30, 40));
        assert_eq!(size.to_string(), "40x30");
    }

    #[test]
    fn test_contains_with_margin_is_strict() {
        let size = ImageSize::from_width_height(100, 50);
        assert!(size.contains_with_margin(10.5, 10.5, 10.0));
        assert!(!size.contains_with_margin(10.0, 20.0, 10.0));
        assert!(!size.contains_with_margin(90.0, 20.0, 10.0));
        assert!(size.contains_with_margin(89.9, 39.9, 10.0));
        assert!(!size.contains_with_margin(50.0, 40.0, 10.0));
    }

    #[test]
    fn test_center() {
        assert_eq!(ImageSize::from((5, 3)).center(), (2.0, 1.0));
    }
}
