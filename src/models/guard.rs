//! Scoped pin on a model version.

use std::ops::Deref;
use std::sync::Arc;

use super::instance::InstanceHandle;

/// RAII pin that keeps a version's resources alive while held.
///
/// Holding a guard never stops the version from being marked `Unloading`;
/// it only delays the release of its resources until the guard is dropped.
#[must_use = "dropping the guard releases the pin immediately"]
pub struct UnloadGuard {
    handle: Arc<InstanceHandle>,
}

impl UnloadGuard {
    /// Wrap a handle whose pin count was already incremented.
    pub(super) fn new(handle: Arc<InstanceHandle>) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &Arc<InstanceHandle> {
        &self.handle
    }
}

impl Deref for UnloadGuard {
    type Target = InstanceHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl std::fmt::Debug for UnloadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("UnloadGuard").field(&self.handle).finish()
    }
}

impl Drop for UnloadGuard {
    fn drop(&mut self) {
        self.handle.release_pin();
    }
}
