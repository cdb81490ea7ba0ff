//! Duplicate detection over the top-level input batch.
//!
//! Runs serially before extraction. Items discovered later inside archives
//! or PDFs are never compared against this table.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::hash::{compute_bytes_hash, compute_content_hash};
use crate::models::{DedupKey, FileInput, FileSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateReason {
    ContentMatch,
    NameMatch,
}

/// One dropped input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateEntry {
    pub original_index: usize,
    pub name: String,
    pub reason: DuplicateReason,
    pub hash: Option<String>,
}

/// A surviving input with the key it was admitted under.
#[derive(Debug, Clone)]
pub struct UniqueInput {
    pub original_index: usize,
    pub input: FileInput,
    pub key: DedupKey,
}

impl UniqueInput {
    pub fn content_hash(&self) -> Option<&str> {
        match &self.key {
            DedupKey::Content(hash) => Some(hash),
            DedupKey::Name(_) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct DedupOutcome {
    pub unique: Vec<UniqueInput>,
    pub duplicates: Vec<DuplicateEntry>,
}

/// Seen-table for one batch. Only admitted items update it.
#[derive(Debug, Default)]
pub struct DuplicateFilter {
    seen_hashes: HashSet<String>,
    seen_names: HashSet<String>,
}

impl DuplicateFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `inputs` into unique items (order preserved) and a duplicate report.
    pub fn filter(mut self, inputs: Vec<FileInput>) -> DedupOutcome {
        let mut outcome = DedupOutcome::default();

        for (index, input) in inputs.into_iter().enumerate() {
            let key = dedup_key(&input);
            let reason = match &key {
                DedupKey::Content(hash) if self.seen_hashes.contains(hash) => {
                    Some(DuplicateReason::ContentMatch)
                }
                DedupKey::Name(name) if self.seen_names.contains(name) => {
                    Some(DuplicateReason::NameMatch)
                }
                _ => None,
            };

            if let Some(reason) = reason {
                let hash = match &key {
                    DedupKey::Content(h) => Some(h.clone()),
                    DedupKey::Name(_) => None,
                };
                tracing::info!(
                    file = %input.name,
                    index,
                    reason = ?reason,
                    "Dropping duplicate input"
                );
                outcome.duplicates.push(DuplicateEntry {
                    original_index: index,
                    name: input.name,
                    reason,
                    hash,
                });
                continue;
            }

            if let DedupKey::Content(hash) = &key {
                self.seen_hashes.insert(hash.clone());
            }
            self.seen_names.insert(input.name.clone());
            outcome.unique.push(UniqueInput {
                original_index: index,
                input,
                key,
            });
        }

        tracing::debug!(
            unique = outcome.unique.len(),
            duplicates = outcome.duplicates.len(),
            "Duplicate filter complete"
        );
        outcome
    }
}

/// Content hash when the bytes can be read, otherwise the display name.
fn dedup_key(input: &FileInput) -> DedupKey {
    let hashed = match &input.source {
        FileSource::Path(path) => compute_content_hash(path),
        FileSource::Inline(bytes) => Ok(compute_bytes_hash(bytes)),
    };
    match hashed {
        Ok(hash) => DedupKey::Content(hash),
        Err(e) => {
            tracing::warn!(
                file = %input.name,
                error = %e,
                "Hashing failed, falling back to name matching"
            );
            DedupKey::Name(input.name.clone())
        }
    }
}
