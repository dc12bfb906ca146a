//! Pipeline configuration.
//!
//! A [`Config`] is a plain value: every experiment variant is its own copy,
//! built from the defaults with struct-update syntax or the `with_*` helpers,
//! and handed to workers by value.

use ndarray::{arr2, Array2};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{PhotometryError, Result};

/// How the empirical PSF is built from star cut-outs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EpsfStrategy {
    /// Iterative residual fitting with smoothing and recentering
    #[default]
    Fit,
    /// Per-pixel median of Fourier-aligned, upsampled cut-outs
    Combine,
}

/// Smoothing kernel applied to the EPSF after every build iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SmoothingKernel {
    None,
    /// 5×5 Gaussian sampled on `linspace(-1, 1, 5)`, see [`make_gauss_kernel`]
    Gaussian { sigma: f64 },
    /// Standard 5×5 quartic (fourth-order polynomial) kernel
    Quartic,
    /// Standard 5×5 quadratic (second-order polynomial) kernel
    Quadratic,
    Custom(Array2<f64>),
}

impl Default for SmoothingKernel {
    fn default() -> Self {
        SmoothingKernel::Gaussian { sigma: 1.0 }
    }
}

impl SmoothingKernel {
    /// Kernel array, or `None` when no smoothing is requested.
    pub fn kernel(&self) -> Option<Array2<f64>> {
        match self {
            SmoothingKernel::None => None,
            SmoothingKernel::Gaussian { sigma } => Some(make_gauss_kernel(*sigma)),
            SmoothingKernel::Quartic => Some(arr2(&[
                [0.041632, -0.080816, 0.078368, -0.080816, 0.041632],
                [-0.080816, -0.019592, 0.200816, -0.019592, -0.080816],
                [0.078368, 0.200816, 0.441632, 0.200816, 0.078368],
                [-0.080816, -0.019592, 0.200816, -0.019592, -0.080816],
                [0.041632, -0.080816, 0.078368, -0.080816, 0.041632],
            ])),
            SmoothingKernel::Quadratic => Some(arr2(&[
                [-0.07428311, 0.01142786, 0.03999952, 0.01142786, -0.07428311],
                [0.01142786, 0.09714283, 0.12571449, 0.09714283, 0.01142786],
                [0.03999952, 0.12571449, 0.15428215, 0.12571449, 0.03999952],
                [0.01142786, 0.09714283, 0.12571449, 0.09714283, 0.01142786],
                [-0.07428311, 0.01142786, 0.03999952, 0.01142786, -0.07428311],
            ])),
            SmoothingKernel::Custom(kernel) => Some(kernel.clone()),
        }
    }
}

/// 5×5 Gaussian over the grid `linspace(-1, 1, 5)²`, normalised to unit sum.
///
/// The grid spacing is half a pixel of the oversampled EPSF, so `sigma` is in
/// units of two grid steps.
pub fn make_gauss_kernel(sigma: f64) -> Array2<f64> {
    let coord = |i: usize| -1.0 + 0.5 * i as f64;
    let mut kernel = Array2::from_shape_fn((5, 5), |(r, c)| {
        let (x, y) = (coord(c), coord(r));
        (-(x * x + y * y) / (2.0 * sigma * sigma)).exp()
    });
    let sum = kernel.sum();
    if sum > 0.0 && sum.is_finite() {
        kernel /= sum;
    }
    kernel
}

/// Every tunable of the photometry pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sigma for the clipped background statistics
    pub clip_sigma: f64,
    /// Detection threshold above the median, in clipped standard deviations
    pub threshold_factor: f64,
    /// Side of the square star cut-outs, in pixels
    pub cutout_size: usize,
    /// FWHM assumed by the candidate finder before any PSF exists
    pub fwhm_guess: f64,
    pub oversampling: usize,
    pub epsfbuilder_iters: usize,
    /// Group stars closer than `separation_factor × FWHM`
    pub separation_factor: f64,
    pub smoothing: SmoothingKernel,
    pub epsf_strategy: EpsfStrategy,
    /// Detect/fit/subtract rounds
    pub photometry_iterations: usize,
    /// Side of the fitting box; derived from the PSF size when unset
    pub fitshape: Option<usize>,
    /// Fit at the catalogue positions instead of detected ones
    pub use_catalogue_positions: bool,
    /// Drop candidates whose nearest neighbour is closer than this
    pub cutoff_dist: Option<f64>,
    pub image_folder: PathBuf,
    pub output_folder: PathBuf,
    /// Fourier upsampling factor for the combine strategy
    pub upsample_factor: usize,
    /// Box used when recentering stars during the EPSF fit
    pub fit_boxsize: usize,
    pub lm_max_iterations: usize,
    pub save_diagnostics: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clip_sigma: 3.0,
            threshold_factor: 3.0,
            cutout_size: 50,
            fwhm_guess: 2.5,
            oversampling: 4,
            epsfbuilder_iters: 3,
            separation_factor: 1.0,
            smoothing: SmoothingKernel::default(),
            epsf_strategy: EpsfStrategy::default(),
            photometry_iterations: 1,
            fitshape: None,
            use_catalogue_positions: false,
            cutoff_dist: None,
            image_folder: PathBuf::from("test_images"),
            output_folder: PathBuf::from("output_files"),
            upsample_factor: 4,
            fit_boxsize: 5,
            lm_max_iterations: 100,
            save_diagnostics: false,
        }
    }
}

static DEFAULT_CONFIG: Lazy<Config> = Lazy::new(Config::default);

impl Config {
    /// Process-wide default configuration.
    pub fn instance() -> &'static Config {
        &DEFAULT_CONFIG
    }

    pub fn with_smoothing(mut self, smoothing: SmoothingKernel) -> Self {
        self.smoothing = smoothing;
        self
    }

    pub fn with_output_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.output_folder = folder.into();
        self
    }

    pub fn with_image_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.image_folder = folder.into();
        self
    }

    /// Fit at catalogue positions with a single photometry pass.
    pub fn with_catalogue_positions(mut self) -> Self {
        self.use_catalogue_positions = true;
        self.photometry_iterations = 1;
        self
    }

    pub fn load(path: &Path) -> Result<Self> {
        let config: Config = shared::io::load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        Ok(shared::io::save_json(self, path)?)
    }

    /// Reject parameter combinations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(PhotometryError::InvalidConfig(msg));
        if self.cutout_size == 0 {
            return fail("cutout_size must be positive".into());
        }
        if self.oversampling == 0 {
            return fail("oversampling must be positive".into());
        }
        if self.upsample_factor == 0 {
            return fail("upsample_factor must be positive".into());
        }
        if !(self.clip_sigma > 0.0) {
            return fail(format!("clip_sigma must be positive, got {}", self.clip_sigma));
        }
        if !(self.fwhm_guess > 0.0) {
            return fail(format!("fwhm_guess must be positive, got {}", self.fwhm_guess));
        }
        if !(self.separation_factor >= 0.0) {
            return fail("separation_factor must be non-negative".into());
        }
        if let Some(shape) = self.fitshape {
            if shape % 2 == 0 {
                return fail(format!("fitshape must be odd, got {shape}"));
            }
        }
        if self.fit_boxsize == 0 || self.fit_boxsize % 2 == 0 {
            return fail(format!("fit_boxsize must be odd, got {}", self.fit_boxsize));
        }
        if let Some(kernel) = self.smoothing.kernel() {
            let sum = kernel.sum();
            if !sum.is_finite() || sum == 0.0 {
                return fail("smoothing kernel must sum to a finite non-zero value".into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_defaults() {
        let config = Config::instance();
        assert_eq!(config.cutout_size, 50);
        assert_eq!(config.oversampling, 4);
        assert_eq!(config.epsfbuilder_iters, 3);
        assert_eq!(config.clip_sigma, 3.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_gauss_kernel_shape_and_norm() {
        let k = make_gauss_kernel(1.0);
        assert_eq!(k.dim(), (5, 5));
        assert_relative_eq!(k.sum(), 1.0, epsilon = 1e-12);
        // Corner is at distance sqrt(2) on the [-1, 1] grid
        assert_relative_eq!(k[[0, 0]] / k[[2, 2]], (-1.0f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_polynomial_kernels_sum_to_one() {
        for kernel in [SmoothingKernel::Quartic, SmoothingKernel::Quadratic] {
            let k = kernel.kernel().unwrap();
            assert_relative_eq!(k.sum(), 1.0, epsilon = 1e-5);
            assert_relative_eq!(k[[0, 1]], k[[1, 0]]);
        }
        assert!(SmoothingKernel::None.kernel().is_none());
    }

    #[test]
    fn test_validate_rejects() {
        let bad = [
            Config {
                cutout_size: 0,
                ..Config::default()
            },
            Config {
                fitshape: Some(10),
                ..Config::default()
            },
            Config {
                clip_sigma: -1.0,
                ..Config::default()
            },
            Config::default().with_smoothing(SmoothingKernel::Custom(Array2::zeros((3, 3)))),
        ];
        for config in bad {
            assert!(matches!(
                config.validate(),
                Err(PhotometryError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_save_load_roundtrip_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config {
            fitshape: Some(11),
            ..Config::default()
        }
        .with_catalogue_positions()
        .with_smoothing(SmoothingKernel::Quartic)
        .with_output_folder("out");

        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{"cutout_size": 31, "oversampling": 2}"#).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.cutout_size, 31);
        assert_eq!(config.oversampling, 2);
        assert_eq!(config.fwhm_guess, 2.5);
    }
}
