use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{Category, ErrorKind, ExtractionStatus, RecordKind};
use crate::pipeline::import::FileCategory;
use crate::pipeline::resources::ArtifactHandle;

/// Position of a record in the logical input tree: top-level input index,
/// then archive entry index, then page number, as deep as nesting goes.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ordinal(pub Vec<u32>);

impl Ordinal {
    pub fn root(index: usize) -> Self {
        Self(vec![index as u32])
    }

    pub fn child(&self, index: usize) -> Self {
        let mut path = self.0.clone();
        path.push(index as u32);
        Self(path)
    }
}

/// Key used to detect duplicate top-level inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DedupKey {
    Content(String),
    Name(String),
}

/// Provenance of a record produced by archive or PDF expansion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    /// Immediate parent archive.
    pub source_archive_id: Option<Uuid>,
    pub source_archive_name: Option<String>,
    /// Outermost archive of the chain.
    pub root_archive_id: Option<Uuid>,
    /// Archive names from the outermost inwards.
    pub archive_path: Vec<String>,
    /// Parent document for page renders.
    pub source_document_id: Option<Uuid>,
    pub page_number: Option<u32>,
    pub index_in_page: Option<u32>,
    pub position: Option<String>,
}

impl Lineage {
    /// Lineage for entries found inside the archive `archive_id`.
    pub fn descend_into_archive(&self, archive_id: Uuid, archive_name: &str) -> Self {
        let mut archive_path = self.archive_path.clone();
        archive_path.push(archive_name.to_string());
        Self {
            source_archive_id: Some(archive_id),
            source_archive_name: Some(archive_name.to_string()),
            root_archive_id: self.root_archive_id.or(Some(archive_id)),
            archive_path,
            ..Self::default()
        }
    }

    /// Lineage for a full-page render of `document_id`.
    pub fn page_of(&self, document_id: Uuid, page_number: u32) -> Self {
        Self {
            source_document_id: Some(document_id),
            page_number: Some(page_number),
            index_in_page: Some(0),
            position: Some(format!("page_{page_number}_full")),
            ..self.clone()
        }
    }

    pub fn is_inside_archive(&self) -> bool {
        self.source_archive_id.is_some()
    }
}

/// Normalized region reported by the vision collaborator.
/// `x`/`y` are the center of the region; all values are in 0..1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Convert to a clamped pixel rectangle `(left, top, width, height)`.
    /// Returns `None` when the clamped region is empty or values are not finite.
    pub fn to_pixel_rect(&self, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
        if ![self.x, self.y, self.width, self.height].iter().all(|v| v.is_finite()) {
            return None;
        }
        let w = image_width as f32;
        let h = image_height as f32;
        let left = ((self.x - self.width / 2.0) * w).clamp(0.0, w);
        let top = ((self.y - self.height / 2.0) * h).clamp(0.0, h);
        let right = ((self.x + self.width / 2.0) * w).clamp(0.0, w);
        let bottom = ((self.y + self.height / 2.0) * h).clamp(0.0, h);

        let crop_w = (right - left) as u32;
        let crop_h = (bottom - top) as u32;
        if crop_w == 0 || crop_h == 0 {
            return None;
        }
        Some((left as u32, top as u32, crop_w, crop_h))
    }
}

/// Non-fatal failure attached to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RecordError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Canonical output unit, one per logical content item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub record_id: Uuid,
    pub kind: RecordKind,
    pub display_name: String,
    pub extension: String,
    pub declared_type: Option<String>,
    pub content_text: Option<String>,
    pub content_length: usize,
    pub category: Option<Category>,
    pub exam_date: Option<NaiveDate>,
    pub classification_note: Option<String>,
    pub has_embedded_image: bool,
    pub bounding_box: Option<BoundingBox>,
    pub extraction_status: ExtractionStatus,
    pub extraction_error: Option<RecordError>,
    pub lineage: Lineage,
    pub ordinal: Ordinal,
    pub local_artifact_path: Option<PathBuf>,
    pub is_persistent_artifact: bool,
    pub artifact_available: bool,
    pub artifact_handle: Option<ArtifactHandle>,
    pub cropped_artifact_path: Option<PathBuf>,
    pub content_hash: Option<String>,
    pub dedup_key: Option<DedupKey>,
}

impl ExtractedRecord {
    /// A fresh record with a new id and no content yet.
    pub fn new(
        kind: RecordKind,
        display_name: impl Into<String>,
        extension: impl Into<String>,
        ordinal: Ordinal,
        lineage: Lineage,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            kind,
            display_name: display_name.into(),
            extension: extension.into(),
            declared_type: None,
            content_text: None,
            content_length: 0,
            category: None,
            exam_date: None,
            classification_note: None,
            has_embedded_image: false,
            bounding_box: None,
            extraction_status: ExtractionStatus::EmptyContent,
            extraction_error: None,
            lineage,
            ordinal,
            local_artifact_path: None,
            is_persistent_artifact: false,
            artifact_available: false,
            artifact_handle: None,
            cropped_artifact_path: None,
            content_hash: None,
            dedup_key: None,
        }
    }

    /// Declared type if the caller gave one, otherwise inferred from the extension.
    pub fn file_type(&self) -> String {
        self.declared_type
            .clone()
            .unwrap_or_else(|| FileCategory::from_extension(&self.extension).as_str().to_string())
    }

    /// Store extracted text. Blank text turns the record into an EmptyContent placeholder.
    pub fn set_content(&mut self, text: String) {
        if text.trim().is_empty() {
            if self.has_embedded_image {
                let placeholder = format!(
                    "{} contains notable visual content but no description was returned",
                    self.display_name
                );
                self.store_text(placeholder);
                self.extraction_status = ExtractionStatus::Success;
            } else {
                self.mark_empty("no text content could be extracted");
            }
            return;
        }
        self.store_text(text);
        self.extraction_status = ExtractionStatus::Success;
    }

    pub fn mark_empty(&mut self, reason: &str) {
        let text = placeholder_text(&self.display_name, &self.file_type(), reason);
        self.store_text(text);
        self.extraction_status = ExtractionStatus::EmptyContent;
    }

    /// EmptyContent with the failure that caused it kept for the caller.
    pub fn mark_empty_with(&mut self, reason: &str, error: RecordError) {
        self.mark_empty(reason);
        self.extraction_error = Some(error);
    }

    pub fn mark_failed(&mut self, error: RecordError) {
        let reason = format!("content extraction failed ({})", error.message);
        let text = placeholder_text(&self.display_name, &self.file_type(), &reason);
        self.store_text(text);
        self.extraction_status = ExtractionStatus::Failed;
        self.extraction_error = Some(error);
    }

    pub fn is_success(&self) -> bool {
        self.extraction_status == ExtractionStatus::Success
    }

    fn store_text(&mut self, text: String) {
        self.content_length = text.chars().count();
        self.content_text = Some(text);
    }
}

/// Human-readable stand-in for content that could not be extracted.
pub fn placeholder_text(display_name: &str, file_type: &str, status: &str) -> String {
    format!("File name: {display_name}\nFile type: {file_type}\nStatus: {status}")
}
