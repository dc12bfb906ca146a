//! Sampled PSF model evaluated by bilinear interpolation.

use meter_math::fit_symmetric_gaussian;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use shared::image_proc::sample_bilinear;

use crate::{PhotometryError, Result};

/// A square PSF image sampled `oversampling` times per detector pixel.
///
/// The PSF center sits at the middle of the array. With `normalized` set the
/// samples sum to one, so [`PsfModel::evaluate`] integrates to one over the
/// detector pixel grid and a fitted flux is the total source flux.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsfModel {
    pub data: Array2<f64>,
    pub oversampling: usize,
    pub normalized: bool,
}

impl PsfModel {
    /// Wrap `data` without normalising it.
    pub fn new(data: Array2<f64>, oversampling: usize) -> Result<Self> {
        let (rows, cols) = data.dim();
        if rows != cols || rows == 0 {
            return Err(PhotometryError::NonSquareKernel { rows, cols });
        }
        if oversampling == 0 {
            return Err(PhotometryError::InvalidConfig(
                "PSF oversampling must be positive".into(),
            ));
        }
        Ok(Self {
            data,
            oversampling,
            normalized: false,
        })
    }

    /// Wrap and normalise `data` to unit sum.
    pub fn normalized(data: Array2<f64>, oversampling: usize) -> Result<Self> {
        let mut model = Self::new(data, oversampling)?;
        model.normalize()?;
        Ok(model)
    }

    pub fn normalize(&mut self) -> Result<()> {
        let sum = self.data.sum();
        if !sum.is_finite() || sum == 0.0 {
            return Err(PhotometryError::DegenerateKernel);
        }
        self.data /= sum;
        self.normalized = true;
        Ok(())
    }

    /// Side of the oversampled array.
    pub fn size(&self) -> usize {
        self.data.nrows()
    }

    /// Array coordinate of the PSF center along either axis.
    pub fn center(&self) -> f64 {
        (self.size() as f64 - 1.0) / 2.0
    }

    /// Extent of the model in detector pixels.
    pub fn shape_in_pixels(&self) -> usize {
        self.size() / self.oversampling
    }

    /// Default fitting box: the model extent made odd, at least 3 pixels.
    pub fn fit_shape(&self) -> usize {
        (self.shape_in_pixels() | 1).max(3)
    }

    /// PSF value per detector pixel at offset `(dx, dy)` pixels from the center.
    pub fn evaluate(&self, dx: f64, dy: f64) -> f64 {
        let os = self.oversampling as f64;
        let gx = self.center() + dx * os;
        let gy = self.center() + dy * os;
        sample_bilinear(self.data.view(), gx, gy) * os * os
    }

    /// Derivatives of [`PsfModel::evaluate`] with respect to `dx` and `dy`,
    /// by central differences over one oversampled cell.
    pub fn gradient(&self, dx: f64, dy: f64) -> (f64, f64) {
        let h = 0.5 / self.oversampling as f64;
        let gx = (self.evaluate(dx + h, dy) - self.evaluate(dx - h, dy)) / (2.0 * h);
        let gy = (self.evaluate(dx, dy + h) - self.evaluate(dx, dy - h)) / (2.0 * h);
        (gx, gy)
    }

    /// FWHM in detector pixels from a circular Gaussian fit to the samples.
    pub fn fwhm_estimate(&self) -> Result<f64> {
        let fit = fit_symmetric_gaussian(self.data.view(), 5.0)?;
        Ok(fit.fwhm() / self.oversampling as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn gaussian_psf(size: usize, oversampling: usize, sigma_px: f64) -> PsfModel {
        let c = (size as f64 - 1.0) / 2.0;
        let s = sigma_px * oversampling as f64;
        let data = Array2::from_shape_fn((size, size), |(r, col)| {
            let dx = col as f64 - c;
            let dy = r as f64 - c;
            (-(dx * dx + dy * dy) / (2.0 * s * s)).exp()
        });
        PsfModel::normalized(data, oversampling).unwrap()
    }

    #[test]
    fn test_rejects_non_square() {
        let err = PsfModel::new(Array2::zeros((3, 4)), 1).unwrap_err();
        assert!(matches!(err, PhotometryError::NonSquareKernel { rows: 3, cols: 4 }));
    }

    #[test]
    fn test_normalize_degenerate() {
        let mut psf = PsfModel::new(Array2::zeros((3, 3)), 1).unwrap();
        assert!(matches!(psf.normalize(), Err(PhotometryError::DegenerateKernel)));
    }

    #[test]
    fn test_evaluate_integrates_to_one() {
        let psf = gaussian_psf(81, 4, 1.5);
        assert_relative_eq!(psf.data.sum(), 1.0, epsilon = 1e-12);
        let mut total = 0.0;
        for dy in -10..=10 {
            for dx in -10..=10 {
                total += psf.evaluate(dx as f64 + 0.3, dy as f64 - 0.2);
            }
        }
        assert_relative_eq!(total, 1.0, epsilon = 1e-2);
        assert_eq!(psf.evaluate(50.0, 0.0), 0.0);
    }

    #[test]
    fn test_gradient_points_to_center() {
        let psf = gaussian_psf(81, 4, 1.5);
        let (gx, gy) = psf.gradient(1.0, -1.0);
        assert!(gx < 0.0);
        assert!(gy > 0.0);
        assert_relative_eq!(gx, -gy, epsilon = 1e-9);
    }

    #[test]
    fn test_fwhm_estimate_undoes_oversampling() {
        let psf = gaussian_psf(101, 4, 2.0);
        let fwhm = psf.fwhm_estimate().unwrap();
        assert_relative_eq!(fwhm, 2.0 * meter_math::FWHM_PER_SIGMA, epsilon = 1e-4);
        assert_eq!(psf.shape_in_pixels(), 25);
        assert_eq!(psf.fit_shape(), 25);
    }
}
