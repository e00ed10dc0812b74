//! Base path validation and on-disk version discovery.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Model path invalid: {0}")]
    PathInvalid(PathBuf),

    #[error("Model path escapes the model root: {0}")]
    PathNotAllowed(PathBuf),

    #[error("No version directory found in {0}")]
    NoVersionAvailable(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves model base paths and lists their numbered version directories.
#[derive(Debug, Clone, Default)]
pub struct VersionScanner {
    model_root: Option<PathBuf>,
}

impl VersionScanner {
    pub fn new() -> Self {
        Self { model_root: None }
    }

    /// Only accept base paths that resolve inside `root`.
    pub fn with_model_root(root: PathBuf) -> Self {
        Self { model_root: Some(root) }
    }

    /// Canonicalize a base path and check it is an allowed directory.
    pub fn validate_base_path(&self, base_path: &Path) -> Result<PathBuf, ScanError> {
        let canonical = base_path
            .canonicalize()
            .map_err(|_| ScanError::PathInvalid(base_path.to_path_buf()))?;

        if !canonical.is_dir() {
            return Err(ScanError::PathInvalid(canonical));
        }

        if let Some(root) = &self.model_root {
            // Canonicalize the root too so symlinked roots compare equal
            let allowed = root
                .canonicalize()
                .map(|root| canonical.starts_with(root))
                .unwrap_or(false);
            if !allowed {
                return Err(ScanError::PathNotAllowed(canonical));
            }
        }

        Ok(canonical)
    }

    /// List version numbers found under `base_path`.
    ///
    /// Entries that are not directories named by a positive integer are skipped.
    pub fn read_available_versions(&self, base_path: &Path) -> Result<Vec<u64>, ScanError> {
        let base = self.validate_base_path(base_path)?;
        let mut versions = Vec::new();

        for entry in std::fs::read_dir(&base)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match name.parse::<u64>() {
                Ok(version) if version > 0 => versions.push(version),
                _ => {
                    tracing::debug!(
                        path = %base.display(),
                        entry = name,
                        "skipping directory that is not a version number"
                    );
                }
            }
        }

        if versions.is_empty() {
            return Err(ScanError::NoVersionAvailable(base));
        }
        versions.sort_unstable();
        Ok(versions)
    }
}

/// Directory holding the artifacts of one version.
pub fn version_path(base_path: &Path, version: u64) -> PathBuf {
    base_path.join(version.to_string())
}
