//! Shared components and utilities for the photometry workspace.
//!
//! This crate contains the image statistics, resampling and persistence
//! helpers used by the simulator and the photometry pipeline, so that both
//! agree on pixel conventions and background estimation.
//!
//! Pixel convention: arrays are indexed `[row, col]` = `[y, x]`, and pixel
//! `(x, y)` covers `[x - 0.5, x + 0.5) × [y - 0.5, y + 0.5)`.

pub mod algo;
pub mod image_proc;
pub mod image_size;
pub mod io;
pub mod test_util;

pub use image_size::ImageSize;
