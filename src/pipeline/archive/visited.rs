//! Cycle detection for recursive archive decomposition.
//!
//! Each recursive call receives an immutable snapshot of the archives on its
//! own branch. Sibling branches never see each other's additions.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::pipeline::import::compute_content_hash;

/// One way of recognising an archive that was already entered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArchiveKey {
    Path(PathBuf),
    Digest(String),
}

/// Location and content digest of one archive.
///
/// Nested copies are unpacked to fresh paths, so the digest is what catches
/// an archive that contains itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveIdentity {
    pub path: PathBuf,
    pub digest: Option<String>,
}

impl ArchiveIdentity {
    /// Reads the whole file to hash it; call from a blocking context.
    pub fn of(path: &Path) -> Self {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let digest = match compute_content_hash(&path) {
            Ok(digest) => Some(digest),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Could not hash archive, cycle check by path only");
                None
            }
        };
        Self { path, digest }
    }

    pub fn keys(&self) -> Vec<ArchiveKey> {
        let mut keys = vec![ArchiveKey::Path(self.path.clone())];
        if let Some(digest) = &self.digest {
            keys.push(ArchiveKey::Digest(digest.clone()));
        }
        keys
    }
}

/// Immutable set of archives entered on the current branch.
#[derive(Debug, Clone, Default)]
pub struct VisitedArchives {
    keys: Arc<HashSet<ArchiveKey>>,
}

impl VisitedArchives {
    pub fn contains(&self, identity: &ArchiveIdentity) -> bool {
        identity.keys().iter().any(|k| self.keys.contains(k))
    }

    /// New snapshot with `additions` on top. `self` is left untouched.
    pub fn with(&self, additions: impl IntoIterator<Item = ArchiveKey>) -> Self {
        let mut keys = (*self.keys).clone();
        keys.extend(additions);
        Self { keys: Arc::new(keys) }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
