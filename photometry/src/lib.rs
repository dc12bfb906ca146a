//! Empirical PSF photometry and its benchmark harness.
//!
//! The pipeline for one image is
//! `candidate finder → EPSF builder → PSF fitter → matcher → offset metrics`:
//!
//! - [`finder`]: DAOFIND-style peak detection and candidate filtering
//! - [`epsf`]: empirical PSF construction (iterative fit or image-stack combination)
//! - [`psf`]: the sampled PSF model shared by the builders and the fitter
//! - [`fitter`]: source grouping and joint position/flux fits
//! - [`evaluation`]: nearest-neighbour matching against ground truth
//! - [`pipeline`]: the per-image entry points and [`pipeline::PhotometryResult`]
//! - [`batch`], [`optimizer`], [`search`]: the benchmark and hyperparameter drivers

pub mod batch;
pub mod config;
pub mod diagnostics;
pub mod epsf;
pub mod evaluation;
pub mod finder;
pub mod fitter;
pub mod optimizer;
pub mod pipeline;
pub mod psf;
pub mod search;
pub mod table;

use thiserror::Error;

pub use config::{Config, EpsfStrategy, SmoothingKernel};
pub use pipeline::PhotometryResult;
pub use psf::PsfModel;

#[derive(Error, Debug)]
pub enum PhotometryError {
    #[error("no usable stars to build a PSF from")]
    NoStars,

    #[error("PSF kernel must be square, got {rows}x{cols}")]
    NonSquareKernel { rows: usize, cols: usize },

    #[error("PSF kernel does not sum to a finite non-zero value")]
    DegenerateKernel,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("fit failed: {0}")]
    Fit(#[from] meter_math::LmError),

    #[error("statistics error: {0}")]
    Stats(#[from] shared::algo::StatsError),

    #[error(transparent)]
    Persist(#[from] shared::io::PersistError),

    #[error(transparent)]
    Recipe(#[from] simulator::RecipeError),

    #[error("image output error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PhotometryError>;
