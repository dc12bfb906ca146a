//! JSON persistence for cached images, result tables and optimizer state.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl PersistError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn json(path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Serialize `value` to `path`, replacing any existing file.
///
/// The data is written to a sibling temporary file and renamed into place,
/// so readers never observe a half-written file. Parent directories are
/// created as needed.
pub fn save_json<T: Serialize + ?Sized>(value: &T, path: &Path) -> Result<(), PersistError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| PersistError::io(parent, e))?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".partial");
    let tmp_path = path.with_file_name(tmp_name);

    let file = fs::File::create(&tmp_path).map_err(|e| PersistError::io(&tmp_path, e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value).map_err(|e| PersistError::json(&tmp_path, e))?;
    writer.flush().map_err(|e| PersistError::io(&tmp_path, e))?;
    drop(writer);

    fs::rename(&tmp_path, path).map_err(|e| PersistError::io(path, e))?;
    log::debug!("wrote {}", path.display());
    Ok(())
}

/// Deserialize a value previously written with [`save_json`].
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, PersistError> {
    let file = fs::File::open(path).map_err(|e| PersistError::io(path, e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| PersistError::json(path, e))
}
