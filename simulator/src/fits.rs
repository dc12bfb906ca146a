//! FITS storage for cached image arrays.
//!
//! Each file holds one double-precision image extension named `IMAGE`. Rows
//! are flipped on write and on read, since FITS puts the origin at the
//! bottom-left while arrays here are indexed from the top row.

use fitsio::compat::fitsfile::FitsFile;
use fitsio::compat::images::{ImageDescription, ImageType, ReadImage, WriteImage};
use ndarray::{s, Array2};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extension name of the stored image.
pub const IMAGE_EXTNAME: &str = "IMAGE";

#[derive(Error, Debug)]
pub enum FitsError {
    #[error("FITS I/O error: {0}")]
    FitsIo(#[from] fitsio::compat::errors::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no 2-D image in {0}")]
    NoImage(PathBuf),

    #[error("cannot reshape image data in {0}")]
    Shape(PathBuf),
}

/// Write `data` to `path`, replacing any existing file.
///
/// The file is written next to its destination and renamed into place, so
/// readers never see a partial image.
pub fn write_image(data: &Array2<f64>, path: &Path) -> Result<(), FitsError> {
    let io = |path: &Path, source| FitsError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| io(parent, e))?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".partial");
    let tmp_path = path.with_file_name(tmp_name);

    {
        let mut fptr = FitsFile::create(&tmp_path).overwrite().open()?;
        let (height, width) = data.dim();
        let description = ImageDescription {
            data_type: ImageType::Double,
            dimensions: vec![width, height],
        };
        let hdu = fptr.create_image(IMAGE_EXTNAME, &description)?;
        let flat: Vec<f64> = data.slice(s![..;-1, ..]).iter().copied().collect();
        f64::write_image(&mut fptr, &hdu, &flat)?;
        hdu.write_key(&mut fptr, "EXTNAME", &IMAGE_EXTNAME.to_string())?;
    }

    fs::rename(&tmp_path, path).map_err(|e| io(path, e))?;
    log::debug!("wrote {}", path.display());
    Ok(())
}

/// Read the first 2-D double image in `path`.
pub fn read_image(path: &Path) -> Result<Array2<f64>, FitsError> {
    let fptr = FitsFile::open(path)?;

    let mut hdu_idx = 0;
    while let Ok(hdu) = fptr.hdu(hdu_idx) {
        hdu_idx += 1;
        let Ok(values) = f64::read_image(&fptr, &hdu) else {
            continue;
        };
        if hdu.read_key::<i64>(&fptr, "NAXIS").unwrap_or(0) != 2 {
            continue;
        }
        let naxis1 = hdu.read_key::<i64>(&fptr, "NAXIS1").unwrap_or(0) as usize;
        let naxis2 = hdu.read_key::<i64>(&fptr, "NAXIS2").unwrap_or(0) as usize;
        let stored = Array2::from_shape_vec((naxis2, naxis1), values)
            .map_err(|_| FitsError::Shape(path.to_path_buf()))?;
        return Ok(stored.slice(s![..;-1, ..]).to_owned());
    }

    Err(FitsError::NoImage(path.to_path_buf()))
}
