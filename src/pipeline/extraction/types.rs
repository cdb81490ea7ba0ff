use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::ExtractionError;
use crate::config;
use crate::models::{BoundingBox, ExtractedRecord, Lineage, Ordinal, PdfMode, RecordKind};
use crate::pipeline::resources::TempResourceManager;

/// Tunables shared by every handler in a run.
#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub pdf_mode: PdfMode,
    /// Worker pool size for leaf entries inside one archive.
    pub archive_entry_concurrency: usize,
    /// Worker pool size for nested archives inside one archive.
    pub nested_archive_concurrency: usize,
    /// Worker pool size for page descriptions of one PDF.
    pub page_vision_concurrency: usize,
    pub max_archive_depth: usize,
    /// Total bytes one archive may unpack to.
    pub max_unpacked_bytes: u64,
    /// Upper bound for a single vision call.
    pub vision_timeout: Duration,
    pub render_dpi: u32,
    pub max_image_bytes: u64,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            pdf_mode: PdfMode::Default,
            archive_entry_concurrency: config::DEFAULT_EXTRACTION_WORKERS,
            nested_archive_concurrency: config::DEFAULT_NESTED_ARCHIVE_WORKERS,
            page_vision_concurrency: config::DEFAULT_PDF_PAGE_WORKERS,
            max_archive_depth: config::DEFAULT_MAX_ARCHIVE_DEPTH,
            max_unpacked_bytes: config::DEFAULT_MAX_UNPACKED_BYTES,
            vision_timeout: Duration::from_secs(config::DEFAULT_VISION_TIMEOUT_SECS),
            render_dpi: super::pdfium::DEFAULT_RENDER_DPI,
            max_image_bytes: config::MAX_IMAGE_BYTES,
        }
    }
}

/// Collaborators and settings shared by all extraction work of one run.
pub struct ExtractionContext {
    pub resources: Arc<TempResourceManager>,
    pub vision: Option<Arc<dyn VisionDescriber>>,
    pub renderer: Option<Arc<dyn PdfPageRenderer>>,
    pub settings: ExtractionSettings,
}

impl ExtractionContext {
    pub fn new(resources: Arc<TempResourceManager>, settings: ExtractionSettings) -> Self {
        Self {
            resources,
            vision: None,
            renderer: None,
            settings,
        }
    }

    pub fn with_vision(mut self, vision: Arc<dyn VisionDescriber>) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn with_pdf_renderer(mut self, renderer: Arc<dyn PdfPageRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }
}

/// One file ready for a format handler. The file always exists on local disk.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub path: PathBuf,
    pub display_name: String,
    pub extension: String,
    pub declared_type: Option<String>,
    pub ordinal: Ordinal,
    pub lineage: Lineage,
}

impl ExtractionJob {
    pub fn new_record(&self, kind: RecordKind) -> ExtractedRecord {
        let mut record = ExtractedRecord::new(
            kind,
            self.display_name.clone(),
            self.extension.clone(),
            self.ordinal.clone(),
            self.lineage.clone(),
        );
        record.declared_type = self.declared_type.clone();
        record
    }
}

/// Parser for one family of formats.
#[async_trait]
pub trait FormatHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lowercase extensions this handler claims.
    fn extensions(&self) -> &'static [&'static str];

    /// Extract one or more records. The first record describes the file itself.
    async fn extract(
        &self,
        job: &ExtractionJob,
        ctx: &Arc<ExtractionContext>,
    ) -> Result<Vec<ExtractedRecord>, ExtractionError>;
}

/// Renders PDF pages to PNG images
pub trait PdfPageRenderer: Send + Sync {
    /// Number of pages in the document.
    fn page_count(&self, pdf_bytes: &[u8]) -> Result<usize, ExtractionError>;

    /// Render one page (0-based) to PNG bytes.
    fn render_page(
        &self,
        pdf_bytes: &[u8],
        page_number: usize,
        dpi: u32,
    ) -> Result<Vec<u8>, ExtractionError>;
}

/// What the vision collaborator saw in an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionDescription {
    pub has_notable_content: bool,
    pub description: String,
    pub bounding_box: Option<BoundingBox>,
}

/// Image and page description model.
#[async_trait]
pub trait VisionDescriber: Send + Sync {
    async fn describe(
        &self,
        image: &[u8],
        mime_type: &str,
    ) -> Result<VisionDescription, ExtractionError>;
}
