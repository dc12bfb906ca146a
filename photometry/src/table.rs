//! Row types for candidate, fit and matched-result tables.
//!
//! Tables are plain `Vec`s of these rows. All positions share the pixel frame
//! of the image they were measured on.

use serde::{Deserialize, Serialize};

pub use simulator::SourceRecord;

/// A peak reported by the star finder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: usize,
    pub x: f64,
    pub y: f64,
    /// Peak pixel value of the background-subtracted image
    pub peak: f64,
    /// Peak of the convolved image divided by the detection threshold
    pub flux: f64,
    pub sharpness: f64,
    pub roundness1: f64,
    pub roundness2: f64,
    /// `-2.5 log10(flux)`
    pub mag: f64,
}

/// One fitted source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitRecord {
    pub id: usize,
    pub group_id: usize,
    /// Photometry pass that first detected the source (1-based)
    pub iter_detected: usize,
    pub x_0: f64,
    pub y_0: f64,
    pub flux_0: f64,
    pub x_fit: f64,
    pub y_fit: f64,
    pub flux_fit: f64,
}

/// A fitted source joined with its nearest ground-truth source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchedRecord {
    pub fit: FitRecord,
    pub x_orig: f64,
    pub y_orig: f64,
    pub flux_orig: f64,
    pub magnitude: f64,
    /// Euclidean distance between fitted and true position
    pub offset: f64,
}

impl MatchedRecord {
    pub fn x_offset(&self) -> f64 {
        self.fit.x_fit - self.x_orig
    }

    pub fn y_offset(&self) -> f64 {
        self.fit.y_fit - self.y_orig
    }
}
