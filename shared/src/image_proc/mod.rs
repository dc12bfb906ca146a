//! Image processing primitives for empirical PSF work.
//!
//! # Module Organization
//! - **convolve2d**: 2D convolution with zero padding, Gaussian kernels
//! - **cutout**: fixed-size sub-images around sub-pixel positions
//! - **bilinear**: sub-pixel sampling and shifting
//! - **fourier**: band-limited (Fourier-domain) upsampling with sub-pixel shifts
//! - **image**: conversions to the `image` crate for diagnostic output

pub mod bilinear;
pub mod convolve2d;
pub mod cutout;
pub mod fourier;
pub mod image;

pub use bilinear::{sample_bilinear, shift_bilinear};
pub use convolve2d::{convolve2d, gaussian_kernel, ConvolveMode, ConvolveOptions};
pub use cutout::{extract_centered, Cutout};
pub use fourier::upsample_image;
pub use image::{array2_to_gray_image, save_scaled_png, scale_to_u8};
