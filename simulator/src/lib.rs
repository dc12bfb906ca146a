//! Synthetic test images for PSF photometry benchmarks.
//!
//! Images are rendered from a known source table so that fitted positions
//! and fluxes can be scored against ground truth. Named scenes live in the
//! [`recipes`] registry and are cached on disk after the first generation.

pub mod catalog;
pub mod fits;
pub mod noise;
pub mod recipes;
pub mod render;

pub use catalog::{flux_to_magnitude, magnitude_to_flux, SourceRecord, ZERO_POINT};
pub use recipes::{
    read_or_generate_image, read_or_generate_psf, registry, Recipe, RecipeError, TestImage,
};
