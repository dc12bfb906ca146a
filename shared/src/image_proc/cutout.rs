//! Fixed-size cut-outs around sub-pixel positions.

use ndarray::{s, Array2, ArrayView2};

/// A square sub-image and the position of its first pixel in the parent image.
#[derive(Debug, Clone, PartialEq)]
pub struct Cutout {
    pub data: Array2<f64>,
    /// Column of `data[[0, 0]]` in the parent image
    pub x_origin: usize,
    /// Row of `data[[0, 0]]` in the parent image
    pub y_origin: usize,
}

impl Cutout {
    /// Convert a parent-image position into cut-out coordinates.
    pub fn to_local(&self, x: f64, y: f64) -> (f64, f64) {
        (x - self.x_origin as f64, y - self.y_origin as f64)
    }

    /// Convert a cut-out position into parent-image coordinates.
    pub fn to_parent(&self, x: f64, y: f64) -> (f64, f64) {
        (x + self.x_origin as f64, y + self.y_origin as f64)
    }
}

/// Extract a `size × size` cut-out whose central pixel contains `(x, y)`.
///
/// For even sizes the position falls into pixel `size / 2`. Returns `None`
/// when any part of the box would leave the image; partial cut-outs are
/// never produced.
pub fn extract_centered(image: ArrayView2<f64>, x: f64, y: f64, size: usize) -> Option<Cutout> {
    if size == 0 || !x.is_finite() || !y.is_finite() {
        return None;
    }
    let (rows, cols) = image.dim();
    let half = (size / 2) as i64;

    let x0 = x.round() as i64 - half;
    let y0 = y.round() as i64 - half;
    if x0 < 0 || y0 < 0 {
        return None;
    }
    let (x0, y0) = (x0 as usize, y0 as usize);
    if x0 + size > cols || y0 + size > rows {
        return None;
    }

    Some(Cutout {
        data: image.slice(s![y0..y0 + size, x0..x0 + size]).to_owned(),
        x_origin: x0,
        y_origin: y0,
    })
}
