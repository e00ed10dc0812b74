//! Shared fixtures for the integration tests: an on-disk model tree and a
//! backend that counts loads and unloads.

#![allow(dead_code)]

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use modelvisor::models::{
    LoadError, LoadRequest, LoadedModel, Manager, ManagerConfig, ModelBackend,
};

/// A version directory holding this file fails to load.
pub const CORRUPT_MARKER: &str = "corrupt";

/// Generous bound for background work in tests.
pub const SETTLE: Duration = Duration::from_secs(10);

/// Blocks loads until opened.
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new(open: bool) -> Self {
        Self { open: Mutex::new(open), cond: Condvar::new() }
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    pub fn close(&self) {
        *self.open.lock() = false;
    }

    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
    }
}

pub struct TestModel {
    pub version: u64,
    pub nireq: u32,
    unloads: Arc<AtomicUsize>,
}

impl LoadedModel for TestModel {
    fn memory_bytes(&self) -> u64 {
        1024
    }

    fn unload(&self) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct TestBackend {
    loads: AtomicUsize,
    unloads: Arc<AtomicUsize>,
    gate: Gate,
}

impl TestBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            unloads: Arc::new(AtomicUsize::new(0)),
            gate: Gate::new(true),
        })
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }
}

impl ModelBackend for TestBackend {
    fn load(&self, request: &LoadRequest<'_>) -> Result<Box<dyn LoadedModel>, LoadError> {
        if !request.version_path.is_dir() {
            return Err(LoadError::PathInvalid(request.version_path.to_path_buf()));
        }
        if request.version_path.join(CORRUPT_MARKER).exists() {
            return Err(LoadError::InvalidFormat(format!(
                "{} is not a model",
                request.version_path.display()
            )));
        }
        self.gate.wait();
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TestModel {
            version: request.version,
            nireq: request.config.nireq,
            unloads: self.unloads.clone(),
        }))
    }
}

/// Create `<root>/<name>/<v>/model.bin` for each version; returns the base path.
pub fn model_tree(root: &Path, name: &str, versions: &[u64]) -> PathBuf {
    let base = root.join(name);
    std::fs::create_dir_all(&base).unwrap();
    for &v in versions {
        add_version(&base, v);
    }
    base
}

pub fn add_version(base: &Path, version: u64) {
    let dir = base.join(version.to_string());
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("model.bin"), b"weights").unwrap();
}

pub fn corrupt_version(base: &Path, version: u64) {
    std::fs::write(base.join(version.to_string()).join(CORRUPT_MARKER), b"").unwrap();
}

/// Manager without a watcher.
pub fn manager(backend: Arc<TestBackend>) -> Arc<Manager> {
    manager_with(backend, Duration::from_secs(5))
}

pub fn manager_with(backend: Arc<TestBackend>, load_wait: Duration) -> Arc<Manager> {
    let config = ManagerConfig { load_wait, watch_interval: None, model_root: None };
    Manager::new(config, backend)
}

/// Config document with one entry per `(name, base_path, extra)`; `extra` is
/// spliced into the config object as-is.
pub fn config_json(models: &[(&str, &Path, &str)]) -> String {
    let entries: Vec<String> = models
        .iter()
        .map(|(name, base, extra)| {
            let extra = if extra.is_empty() { String::new() } else { format!(", {}", extra) };
            format!(
                r#"{{"config": {{"name": "{}", "base_path": "{}"{}}}}}"#,
                name,
                base.display(),
                extra
            )
        })
        .collect();
    format!(r#"{{"model_config_list": [{}]}}"#, entries.join(", "))
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
