//! Temp-file lifecycle for one pipeline run.
//!
//! Two classes of resource:
//! - **Ephemeral** scratch directories (`ScratchDir`), removed when the guard
//!   drops, on every exit path including unwinding.
//! - **Persistent** directories (`PersistentDir`) holding artifacts a downstream
//!   consumer still needs. They are removed only by an explicit `release`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ErrorKind, RecordError};

/// Name prefix of scratch directories; persistent ones use `PERSISTENT_PREFIX`.
pub(crate) const SCRATCH_PREFIX: &str = "medintake_tmp";
pub(crate) const PERSISTENT_PREFIX: &str = "medintake_keep";

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Failed to create temp directory under {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown artifact handle: {0}")]
    UnknownHandle(ArtifactHandle),
}

impl From<ResourceError> for RecordError {
    fn from(e: ResourceError) -> Self {
        RecordError::new(ErrorKind::Resource, e.to_string())
    }
}

/// Caller-visible id of a persistent artifact directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactHandle(Uuid);

impl std::fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ephemeral scratch directory. Deleted on drop.
#[derive(Debug)]
pub struct ScratchDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl ScratchDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove scratch directory");
            }
        }
    }
}

/// Persistent directory registered with the manager.
#[derive(Debug, Clone)]
pub struct PersistentDir {
    pub handle: ArtifactHandle,
    pub path: PathBuf,
}

/// Tracks temp resources for one run. Shared across workers behind an `Arc`.
#[derive(Debug)]
pub struct TempResourceManager {
    root: PathBuf,
    persistent: Mutex<HashMap<ArtifactHandle, PathBuf>>,
}

impl TempResourceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            persistent: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Acquire a scratch directory scoped to the caller.
    pub fn scratch(&self, label: &str) -> Result<ScratchDir, ResourceError> {
        std::fs::create_dir_all(&self.root).map_err(|source| ResourceError::Create {
            path: self.root.clone(),
            source,
        })?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{SCRATCH_PREFIX}_{label}_"))
            .tempdir_in(&self.root)
            .map_err(|source| ResourceError::Create {
                path: self.root.clone(),
                source,
            })?;
        let path = dir.path().to_path_buf();
        tracing::debug!(path = %path.display(), "Created scratch directory");
        Ok(ScratchDir {
            dir: Some(dir),
            path,
        })
    }

    /// Create and register a persistent directory.
    pub fn create_persistent(&self, label: &str) -> Result<PersistentDir, ResourceError> {
        let id = Uuid::new_v4();
        let path = self
            .root
            .join(format!("{PERSISTENT_PREFIX}_{label}_{}", id.simple()));
        std::fs::create_dir_all(&path).map_err(|source| ResourceError::Create {
            path: path.clone(),
            source,
        })?;

        let handle = ArtifactHandle(id);
        self.registry().insert(handle, path.clone());
        tracing::debug!(handle = %handle, path = %path.display(), "Registered persistent directory");
        Ok(PersistentDir { handle, path })
    }

    /// Remove a persistent directory and forget its handle.
    pub fn release(&self, handle: ArtifactHandle) -> Result<(), ResourceError> {
        let path = self
            .registry()
            .remove(&handle)
            .ok_or(ResourceError::UnknownHandle(handle))?;
        match std::fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ResourceError::Remove { path, source }),
        }
    }

    /// Release `handle` if its directory holds no files. Returns whether it was released.
    pub fn release_if_empty(&self, handle: ArtifactHandle) -> Result<bool, ResourceError> {
        let path = match self.path_of(handle) {
            Some(p) => p,
            None => return Err(ResourceError::UnknownHandle(handle)),
        };
        let empty = std::fs::read_dir(&path)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true);
        if empty {
            self.release(handle)?;
        }
        Ok(empty)
    }

    /// Release every registered directory. Failures are logged and counted.
    pub fn release_all(&self) -> usize {
        let mut failures = 0;
        for handle in self.handles() {
            if let Err(e) = self.release(handle) {
                failures += 1;
                tracing::warn!(handle = %handle, error = %e, "Failed to release persistent directory");
            }
        }
        failures
    }

    pub fn path_of(&self, handle: ArtifactHandle) -> Option<PathBuf> {
        self.registry().get(&handle).cloned()
    }

    pub fn handles(&self) -> Vec<ArtifactHandle> {
        self.registry().keys().copied().collect()
    }

    pub fn persistent_count(&self) -> usize {
        self.registry().len()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<ArtifactHandle, PathBuf>> {
        self.persistent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Persistent artifacts handed to the caller at the end of a run.
///
/// Nothing is removed automatically: call `release` once an artifact has been
/// consumed, or `release_all` when the batch is done.
#[derive(Debug)]
pub struct PersistentArtifacts {
    manager: Arc<TempResourceManager>,
}

impl PersistentArtifacts {
    pub fn new(manager: Arc<TempResourceManager>) -> Self {
        Self { manager }
    }

    pub fn handles(&self) -> Vec<ArtifactHandle> {
        self.manager.handles()
    }

    pub fn path_of(&self, handle: ArtifactHandle) -> Option<PathBuf> {
        self.manager.path_of(handle)
    }

    pub fn len(&self) -> usize {
        self.manager.persistent_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn release(&self, handle: ArtifactHandle) -> Result<(), ResourceError> {
        self.manager.release(handle)
    }

    /// Returns the number of directories that could not be removed.
    pub fn release_all(&self) -> usize {
        self.manager.release_all()
    }
}

impl Drop for PersistentArtifacts {
    fn drop(&mut self) {
        let remaining = self.manager.persistent_count();
        if remaining > 0 {
            tracing::warn!(
                remaining,
                root = %self.manager.root().display(),
                "Persistent artifacts dropped without release; files left on disk"
            );
        }
    }
}
