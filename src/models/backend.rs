//! Compute backend seam.
//!
//! The lifecycle code only ever talks to a backend through `ModelBackend`
//! (turn a version directory into resident resources) and `LoadedModel`
//! (release them). `MmapBackend` is the built-in implementation; tests plug in
//! their own.

use std::any::Any;
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use thiserror::Error;

use super::model_config::VersionConfig;
use super::status::ErrorCode;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Version path invalid: {0}")]
    PathInvalid(PathBuf),

    #[error("No model file found in {0}")]
    ModelFileMissing(PathBuf),

    #[error("Invalid model format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported target device: {0}")]
    UnsupportedDevice(String),

    #[error("Backend failure: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoadError {
    /// Code recorded on the version status when this error ends a load.
    pub fn code(&self) -> ErrorCode {
        match self {
            LoadError::PathInvalid(_) => ErrorCode::PathInvalid,
            LoadError::ModelFileMissing(_) => ErrorCode::ModelFileMissing,
            LoadError::InvalidFormat(_) => ErrorCode::InvalidFormat,
            LoadError::UnsupportedDevice(_) => ErrorCode::UnsupportedDevice,
            LoadError::Backend(_) => ErrorCode::BackendFailure,
            LoadError::Io(_) => ErrorCode::Io,
        }
    }
}

/// Everything a backend needs to load one version.
#[derive(Debug, Clone, Copy)]
pub struct LoadRequest<'a> {
    pub model_name: &'a str,
    pub version: u64,
    pub version_path: &'a Path,
    pub config: &'a VersionConfig,
}

/// Resources of one loaded version.
pub trait LoadedModel: Send + Sync {
    /// Resident bytes attributed to this version.
    fn memory_bytes(&self) -> u64;

    /// Release backend resources. Called exactly once, after the last pin is gone.
    fn unload(&self) {}

    fn as_any(&self) -> &dyn Any;
}

/// Turns a version directory into a `LoadedModel`.
pub trait ModelBackend: Send + Sync {
    /// May block for a long time; always called from a blocking worker.
    fn load(&self, request: &LoadRequest<'_>) -> Result<Box<dyn LoadedModel>, LoadError>;
}

/// Artifact extensions `MmapBackend` recognizes.
const MODEL_EXTENSIONS: &[&str] = &["onnx", "gguf", "safetensors", "bin", "xml"];

/// Devices `MmapBackend` can serve.
const SUPPORTED_DEVICES: &[&str] = &["CPU", "AUTO"];

/// Memory-maps every model artifact in a version directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapBackend;

impl MmapBackend {
    pub fn new() -> Self {
        Self
    }

    fn artifact_paths(dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
        if !dir.is_dir() {
            return Err(LoadError::PathInvalid(dir.to_path_buf()));
        }
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let known = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| MODEL_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if known && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

impl ModelBackend for MmapBackend {
    fn load(&self, request: &LoadRequest<'_>) -> Result<Box<dyn LoadedModel>, LoadError> {
        let device = request.config.target_device.to_ascii_uppercase();
        if !SUPPORTED_DEVICES.contains(&device.as_str()) {
            return Err(LoadError::UnsupportedDevice(request.config.target_device.clone()));
        }

        let paths = Self::artifact_paths(request.version_path)?;
        if paths.is_empty() {
            return Err(LoadError::ModelFileMissing(request.version_path.to_path_buf()));
        }

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            if std::fs::metadata(&path)?.len() == 0 {
                return Err(LoadError::InvalidFormat(format!("empty model file: {}", path.display())));
            }
            files.push(MappedModel::open(&path)?);
        }

        Ok(Box::new(MappedVersion { files }))
    }
}

/// Memory-mapped model file for zero-copy loading.
pub struct MappedModel {
    path: PathBuf,
    mmap: Mmap,
}

// SAFETY: Mmap is Send+Sync when underlying file is read-only and not modified.
// We only use read-only mappings and model files are immutable while served.
unsafe impl Send for MappedModel {}
unsafe impl Sync for MappedModel {}

impl MappedModel {
    pub fn open(path: &Path) -> Result<Self, LoadError> {
        let file = File::open(path)?;
        // SAFETY: File is opened read-only, version directories are not modified while served
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { path: path.to_path_buf(), mmap })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Model data as a byte slice (zero-copy).
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

/// All mapped artifacts of one version.
pub struct MappedVersion {
    files: Vec<MappedModel>,
}

impl MappedVersion {
    pub fn files(&self) -> &[MappedModel] {
        &self.files
    }
}

impl LoadedModel for MappedVersion {
    fn memory_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.len() as u64).sum()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
