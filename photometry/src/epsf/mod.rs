//! Empirical PSF construction from star cut-outs.
//!
//! Two strategies are available, selected by [`EpsfStrategy`]:
//! [`fit::build_epsf_fit`] iteratively refines an oversampled model and the
//! star centers against each other, [`combine::build_epsf_combine`] aligns
//! Fourier-upsampled cut-outs and takes their per-pixel median.

pub mod combine;
pub mod fit;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::config::{Config, EpsfStrategy};
use crate::finder::{make_stars_guess, StarGuesses};
use crate::psf::PsfModel;
use crate::Result;

/// A background-subtracted stamp around one star.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StarCutout {
    pub id: usize,
    pub data: Array2<f64>,
    /// Column of `data[[0, 0]]` in the image
    pub x_origin: usize,
    /// Row of `data[[0, 0]]` in the image
    pub y_origin: usize,
    /// Star center `(x, y)` in cut-out coordinates
    pub cutout_center: (f64, f64),
    pub flux: f64,
}

impl StarCutout {
    /// Star center in image coordinates.
    pub fn center(&self) -> (f64, f64) {
        (
            self.cutout_center.0 + self.x_origin as f64,
            self.cutout_center.1 + self.y_origin as f64,
        )
    }

    /// Cut-out scaled to unit flux.
    pub fn normalized(&self) -> Array2<f64> {
        if self.flux != 0.0 && self.flux.is_finite() {
            &self.data / self.flux
        } else {
            self.data.clone()
        }
    }

    pub fn size(&self) -> usize {
        self.data.nrows()
    }
}

/// Output of [`make_epsf`].
#[derive(Debug, Clone)]
pub struct EpsfOutcome {
    pub psf: PsfModel,
    /// Stars that contributed to the model
    pub stars: Vec<StarCutout>,
    pub guesses: StarGuesses,
}

/// Detect stars in `image` and build an EPSF with the configured strategy.
pub fn make_epsf(image: ArrayView2<f64>, config: &Config) -> Result<EpsfOutcome> {
    let guesses = make_stars_guess(image, config)?;
    let (psf, stars) = match config.epsf_strategy {
        EpsfStrategy::Fit => fit::build_epsf_fit(&guesses.stars, config)?,
        EpsfStrategy::Combine => (
            combine::build_epsf_combine(&guesses.stars, config)?,
            guesses.stars.clone(),
        ),
    };
    log::info!(
        "{:?} EPSF from {} of {} stars, {}x{} samples",
        config.epsf_strategy,
        stars.len(),
        guesses.stars.len(),
        psf.size(),
        psf.size()
    );
    Ok(EpsfOutcome { psf, stars, guesses })
}


#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_star_cutout_center_and_normalization() {
        let star = StarCutout {
            id: 3,
            data: Array2::from_elem((5, 5), 2.0),
            x_origin: 10,
            y_origin: 20,
            cutout_center: (2.25, 1.75),
            flux: 50.0,
        };
        assert_eq!(star.center(), (12.25, 21.75));
        assert_relative_eq!(star.normalized().sum(), 1.0, epsilon = 1e-12);
        assert_eq!(star.size(), 5);
    }
}
