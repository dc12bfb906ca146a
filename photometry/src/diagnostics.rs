//! Image and table dumps for inspecting a photometry run.

use ndarray::{s, Array2};
use shared::image_proc::save_scaled_png;
use shared::io::save_json;
use std::path::Path;

use crate::epsf::StarCutout;
use crate::pipeline::PhotometryResult;
use crate::Result;

/// Tile the stars into one image, each scaled to a peak of 1, with a
/// one-pixel gap between tiles.
pub fn concat_star_images(stars: &[StarCutout]) -> Array2<f64> {
    let Some(size) = stars.iter().map(StarCutout::size).max() else {
        return Array2::zeros((0, 0));
    };
    let columns = (stars.len() as f64).sqrt().ceil() as usize;
    let rows = stars.len().div_ceil(columns);
    let pitch = size + 1;
    let mut mosaic = Array2::zeros((rows * pitch - 1, columns * pitch - 1));

    for (i, star) in stars.iter().enumerate() {
        let (r0, c0) = ((i / columns) * pitch, (i % columns) * pitch);
        let (h, w) = star.data.dim();
        let peak = star.data.iter().copied().fold(f64::MIN, f64::max);
        let scale = if peak > 0.0 { 1.0 / peak } else { 1.0 };
        mosaic
            .slice_mut(s![r0..r0 + h, c0..c0 + w])
            .assign(&(&star.data * scale));
    }
    mosaic
}

/// Write `<name>_epsf.png`, `<name>_stars.png` and `<name>_matched.json`
/// to `folder`.
pub fn write_diagnostics(result: &PhotometryResult, folder: &Path) -> Result<()> {
    std::fs::create_dir_all(folder)?;
    let stem = result.filename.replace(['/', '\\'], "_");

    // Log stretch so the wings stay visible
    let epsf = result.psf.data.mapv(|v| (v.max(0.0) + 1e-6).log10());
    save_scaled_png(epsf.view(), &folder.join(format!("{stem}_epsf.png")))?;

    if !result.star_cutouts.is_empty() {
        let mosaic = concat_star_images(&result.star_cutouts);
        save_scaled_png(mosaic.view(), &folder.join(format!("{stem}_stars.png")))?;
    }

    save_json(&result.matched(), &folder.join(format!("{stem}_matched.json")))?;
    log::debug!("diagnostics for {} written to {}", result.filename, folder.display());
    Ok(())
}
