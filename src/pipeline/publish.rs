//! Upload of persistent artifacts after a run, then release of their
//! temp directories.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::models::ExtractedRecord;
use crate::pipeline::processor::IntakeOutput;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Artifact file missing: {0}")]
    Missing(PathBuf),

    #[error("Upload of {key} failed: {reason}")]
    Upload { key: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination for artifacts. Returns the public URL of the stored object.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, local_path: &Path, key: &str) -> Result<String, StorageError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishedArtifact {
    pub record_id: Uuid,
    pub key: String,
    pub url: String,
    pub cropped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishFailure {
    pub record_id: Uuid,
    pub key: String,
    pub error: String,
}

#[derive(Debug, Default, Serialize)]
pub struct PublishReport {
    pub uploaded: Vec<PublishedArtifact>,
    pub failed: Vec<PublishFailure>,
    /// Persistent directories that could not be removed afterwards.
    pub release_failures: usize,
}

/// Object key for a record's artifact: `{record_id}.{ext}`.
pub fn artifact_key(record: &ExtractedRecord, path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| record.extension.clone());
    format!("{}.{}", record.record_id, ext)
}

/// Upload every available persistent artifact and crop of `output`, then
/// release all persistent directories. Upload failures are reported per
/// artifact and never stop the others.
pub async fn publish_artifacts(output: &IntakeOutput, store: &dyn ObjectStore) -> PublishReport {
    let mut report = PublishReport::default();

    for record in &output.records {
        let mut uploads = Vec::new();
        if record.is_persistent_artifact && record.artifact_available {
            if let Some(path) = &record.local_artifact_path {
                uploads.push((path.clone(), artifact_key(record, path), false));
            }
        }
        if let Some(path) = &record.cropped_artifact_path {
            uploads.push((path.clone(), format!("cropped_{}", artifact_key(record, path)), true));
        }

        for (path, key, cropped) in uploads {
            match upload(store, &path, &key).await {
                Ok(url) => {
                    tracing::info!(file = %record.display_name, key = %key, "Artifact uploaded");
                    report.uploaded.push(PublishedArtifact {
                        record_id: record.record_id,
                        key,
                        url,
                        cropped,
                    });
                }
                Err(e) => {
                    tracing::warn!(file = %record.display_name, key = %key, error = %e, "Artifact upload failed");
                    report.failed.push(PublishFailure {
                        record_id: record.record_id,
                        key,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    report.release_failures = output.artifacts.release_all();
    tracing::info!(
        uploaded = report.uploaded.len(),
        failed = report.failed.len(),
        release_failures = report.release_failures,
        "Artifact publishing complete"
    );
    report
}

async fn upload(store: &dyn ObjectStore, path: &Path, key: &str) -> Result<String, StorageError> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Err(StorageError::Missing(path.to_path_buf()));
    }
    store.put(path, key).await
}

/// Store that copies objects into a local directory.
pub struct DirectoryStore {
    root: PathBuf,
    base_url: String,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>, base_url: &str) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for DirectoryStore {
    async fn put(&self, local_path: &Path, key: &str) -> Result<String, StorageError> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::copy(local_path, self.root.join(key)).await?;
        Ok(format!("{}/{}", self.base_url, key))
    }
}

// ── Mock for testing ──────────────────────────────────────

/// Records every put; keys listed in `failing` are rejected.
#[derive(Default)]
pub struct MockObjectStore {
    puts: Mutex<Vec<String>>,
    failing: Vec<String>,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, key: impl Into<String>) -> Self {
        self.failing.push(key.into());
        self
    }

    pub fn keys(&self) -> Vec<String> {
        self.puts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn put(&self, _local_path: &Path, key: &str) -> Result<String, StorageError> {
        if self.failing.iter().any(|k| k == key) {
            return Err(StorageError::Upload {
                key: key.to_string(),
                reason: "bucket unavailable".into(),
            });
        }
        self.puts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(key.to_string());
        Ok(format!("https://objects.test/{key}"))
    }
}
