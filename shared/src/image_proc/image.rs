use image::{GrayImage, ImageError, Luma};
use ndarray::{Array2, ArrayView2};
use std::path::Path;

/// Converts an `Array2<u8>` to an `image::GrayImage`
///
/// Array indices `[y, x]` map to pixel coordinates `(x, y)`; the array shape
/// is `(height, width)` while the image reports `(width, height)`.
pub fn array2_to_gray_image(arr: &Array2<u8>) -> GrayImage {
    let (height, width) = arr.dim();
    let mut img = GrayImage::new(width as u32, height as u32);
    for ((y, x), &v) in arr.indexed_iter() {
        img.put_pixel(x as u32, y as u32, Luma([v]));
    }
    img
}

/// Linearly map finite values onto 0..=255 between the array min and max.
///
/// Non-finite pixels map to 0. A constant array maps to all zeros.
pub fn scale_to_u8(data: ArrayView2<f64>) -> Array2<u8> {
    let (lo, hi) = data
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let span = hi - lo;
    data.mapv(|v| {
        if !v.is_finite() || !(span > 0.0) {
            0
        } else {
            (((v - lo) / span) * 255.0).round().clamp(0.0, 255.0) as u8
        }
    })
}

/// Save a float array as an 8-bit grayscale PNG, stretched min to max.
pub fn save_scaled_png(data: ArrayView2<f64>, path: &Path) -> Result<(), ImageError> {
    array2_to_gray_image(&scale_to_u8(data)).save(path)
}
