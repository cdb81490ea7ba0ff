use std::path::{Path, PathBuf};

use crate::pipeline::import::InputError;

/// Where the bytes of an uploaded file live.
#[derive(Debug, Clone)]
pub enum FileSource {
    /// A file on local disk owned by the caller.
    Path(PathBuf),
    /// Bytes supplied directly by the caller.
    Inline(Vec<u8>),
}

/// One caller-supplied upload. Immutable once handed to the pipeline.
#[derive(Debug, Clone)]
pub struct FileInput {
    pub name: String,
    pub source: FileSource,
    pub declared_type: Option<String>,
    pub size: u64,
}

impl FileInput {
    /// Build an input from a file on disk, taking the name and size from the filesystem.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, InputError> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path).map_err(|source| InputError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        if !metadata.is_file() {
            return Err(InputError::NotAFile(path.to_path_buf()));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            name,
            source: FileSource::Path(path.to_path_buf()),
            declared_type: None,
            size: metadata.len(),
        })
    }

    pub fn inline(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self {
            name: name.into(),
            source: FileSource::Inline(bytes),
            declared_type: None,
            size,
        }
    }

    pub fn with_declared_type(mut self, declared_type: impl Into<String>) -> Self {
        self.declared_type = Some(declared_type.into());
        self
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            FileSource::Path(p) => Some(p),
            FileSource::Inline(_) => None,
        }
    }
}
