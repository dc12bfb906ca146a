//! Helpers for tests that write artifacts to disk.

use once_cell::sync::Lazy;
use std::env;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum TestUtilError {
    #[error("Failed to find workspace root: {0}")]
    WorkspaceRootNotFound(String),
}

/// Walk upward from the current directory to the workspace `Cargo.toml`.
pub fn find_workspace_root() -> Result<PathBuf, TestUtilError> {
    let mut current_dir = env::current_dir().map_err(|e| {
        TestUtilError::WorkspaceRootNotFound(format!("Failed to get current directory: {e}"))
    })?;

    loop {
        let cargo_toml = current_dir.join("Cargo.toml");
        if cargo_toml.exists() {
            let content = std::fs::read_to_string(&cargo_toml).map_err(|e| {
                TestUtilError::WorkspaceRootNotFound(format!("Failed to read Cargo.toml: {e}"))
            })?;
            if content.contains("[workspace]") {
                return Ok(current_dir);
            }
        }
        if !current_dir.pop() {
            break;
        }
    }

    Err(TestUtilError::WorkspaceRootNotFound(
        "no Cargo.toml with [workspace] above the current directory".to_string(),
    ))
}

static WORKSPACE_ROOT: Lazy<PathBuf> =
    Lazy::new(|| find_workspace_root().expect("Failed to find workspace root directory"));

/// `<workspace>/test_output/<name>`, created on first use.
///
/// Diagnostic PNGs and JSON dumps from tests land here so they can be
/// inspected after a run.
pub fn test_output_dir(name: &str) -> PathBuf {
    let output_dir = WORKSPACE_ROOT.join("test_output").join(name);
    if !output_dir.exists() {
        std::fs::create_dir_all(&output_dir).expect("Failed to create test output directory");
    }
    output_dir
}
