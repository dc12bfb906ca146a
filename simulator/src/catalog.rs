//! Ground-truth source records and the magnitude scale.

use serde::{Deserialize, Serialize};

/// Magnitude of a source producing one count in total.
pub const ZERO_POINT: f64 = 30.0;

/// Total counts for a source of magnitude `mag`.
pub fn magnitude_to_flux(mag: f64) -> f64 {
    10f64.powf(-0.4 * (mag - ZERO_POINT))
}

/// Magnitude of a source with `flux` total counts; NaN for non-positive flux.
pub fn flux_to_magnitude(flux: f64) -> f64 {
    if flux > 0.0 {
        ZERO_POINT - 2.5 * flux.log10()
    } else {
        f64::NAN
    }
}

/// One row of a source table, in pixel coordinates of the image it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: Option<usize>,
    pub x: f64,
    pub y: f64,
    pub flux: f64,
    pub magnitude: f64,
}

impl SourceRecord {
    pub fn from_magnitude(id: usize, x: f64, y: f64, magnitude: f64) -> Self {
        Self {
            id: Some(id),
            x,
            y,
            flux: magnitude_to_flux(magnitude),
            magnitude,
        }
    }

    pub fn from_flux(id: Option<usize>, x: f64, y: f64, flux: f64) -> Self {
        Self {
            id,
            x,
            y,
            flux,
            magnitude: flux_to_magnitude(flux),
        }
    }
}
