//! Extension-keyed handler registry. Archives are handed to the
//! decomposer; everything else goes to exactly one format handler.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;

use super::image::ImageHandler;
use super::office::{DocxHandler, LegacyPptHandler, PptxHandler};
use super::pdf::PdfHandler;
use super::text::{JsonHandler, PassthroughHandler, TextHandler};
use super::types::{ExtractionContext, ExtractionJob, FormatHandler};
use super::ExtractionError;
use crate::models::{ExtractedRecord, RecordKind};
use crate::pipeline::archive::{ArchiveDecomposer, VisitedArchives};
use crate::pipeline::import::{is_hidden_name, ARCHIVE_EXTENSION};

pub struct ExtractionDispatcher {
    handlers: HashMap<&'static str, Arc<dyn FormatHandler>>,
    fallback: Arc<dyn FormatHandler>,
    ctx: Arc<ExtractionContext>,
}

impl ExtractionDispatcher {
    /// Dispatcher with the built-in handlers registered.
    pub fn new(ctx: Arc<ExtractionContext>) -> Self {
        let mut dispatcher = Self {
            handlers: HashMap::new(),
            fallback: Arc::new(PassthroughHandler),
            ctx,
        };
        dispatcher.register(Arc::new(TextHandler));
        dispatcher.register(Arc::new(JsonHandler));
        dispatcher.register(Arc::new(DocxHandler));
        dispatcher.register(Arc::new(PptxHandler));
        dispatcher.register(Arc::new(LegacyPptHandler));
        dispatcher.register(Arc::new(ImageHandler));
        dispatcher.register(Arc::new(PdfHandler));
        dispatcher
    }

    /// Register `handler` for all its extensions, replacing earlier claims.
    pub fn register(&mut self, handler: Arc<dyn FormatHandler>) {
        for ext in handler.extensions() {
            self.handlers.insert(ext, handler.clone());
        }
    }

    pub fn handler_for(&self, extension: &str) -> Arc<dyn FormatHandler> {
        self.handlers
            .get(extension.to_ascii_lowercase().as_str())
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn context(&self) -> &Arc<ExtractionContext> {
        &self.ctx
    }

    /// Extract one top-level file. Returns `None` for hidden/system files.
    pub async fn dispatch(self: &Arc<Self>, job: ExtractionJob) -> Option<Vec<ExtractedRecord>> {
        if is_hidden_name(&job.display_name) {
            tracing::debug!(file = %job.display_name, "Skipping hidden/system file");
            return None;
        }
        if job.extension == ARCHIVE_EXTENSION {
            let decomposition = ArchiveDecomposer::new(self.clone())
                .decompose(job, VisitedArchives::default(), 0)
                .await;
            return Some(decomposition.records);
        }
        Some(self.extract_leaf(&job).await)
    }

    /// Run the matching handler. Handler errors and panics become a Failed
    /// record; the first record always describes the file itself.
    pub async fn extract_leaf(&self, job: &ExtractionJob) -> Vec<ExtractedRecord> {
        let handler = self.handler_for(&job.extension);
        tracing::debug!(file = %job.display_name, handler = handler.name(), "Dispatching file");

        let outcome = AssertUnwindSafe(handler.extract(job, &self.ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(ExtractionError::ParserPanicked(format!(
                    "{} handler panicked",
                    handler.name()
                )))
            });

        match outcome {
            Ok(records) if !records.is_empty() => records,
            Ok(_) => {
                let mut record = job.new_record(RecordKind::Document);
                record.mark_empty("handler produced no content");
                vec![record]
            }
            Err(e) => {
                tracing::warn!(
                    file = %job.display_name,
                    handler = handler.name(),
                    error = %e,
                    "Extraction failed"
                );
                let mut record = job.new_record(RecordKind::Document);
                record.mark_failed(e.into());
                vec![record]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtractionStatus, Lineage, Ordinal};
    use crate::pipeline::extraction::pdf::make_test_pdf;
    use crate::pipeline::resources::TempResourceManager;
    use async_trait::async_trait;
    use std::path::Path;

    fn dispatcher(root: &Path) -> Arc<ExtractionDispatcher> {
        let ctx = Arc::new(ExtractionContext::new(
            Arc::new(TempResourceManager::new(root)),
            Default::default(),
        ));
        Arc::new(ExtractionDispatcher::new(ctx))
    }

    fn job(dir: &Path, name: &str, bytes: &[u8]) -> ExtractionJob {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        ExtractionJob {
            path,
            display_name: name.into(),
            extension: crate::pipeline::import::extension_of(name),
            declared_type: None,
            ordinal: Ordinal::root(0),
            lineage: Lineage::default(),
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl FormatHandler for PanickingHandler {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn extensions(&self) -> &'static [&'static str] {
            &["boom"]
        }

        async fn extract(
            &self,
            _job: &ExtractionJob,
            _ctx: &Arc<ExtractionContext>,
        ) -> Result<Vec<ExtractedRecord>, ExtractionError> {
            panic!("parser state corrupted")
        }
    }

    #[test]
    fn routes_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path());
        assert_eq!(d.handler_for("pdf").name(), "pdf");
        assert_eq!(d.handler_for("PDF").name(), "pdf");
        assert_eq!(d.handler_for("docx").name(), "docx");
        assert_eq!(d.handler_for("jpg").name(), "image");
        assert_eq!(d.handler_for("md").name(), "text");
        assert_eq!(d.handler_for("xyz").name(), "passthrough");
    }

    #[tokio::test]
    async fn hidden_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path());
        assert!(d.dispatch(job(dir.path(), ".DS_Store", b"junk")).await.is_none());
        assert!(d.dispatch(job(dir.path(), "Thumbs.db", b"junk")).await.is_none());
    }

    #[tokio::test]
    async fn text_file_extracts() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path());
        let records = d
            .dispatch(job(dir.path(), "readme.txt", b"Fasting glucose 5.1"))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content_text.as_deref(), Some("Fasting glucose 5.1"));
    }

    #[tokio::test]
    async fn parser_error_becomes_failed_record() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path());
        let records = d
            .dispatch(job(dir.path(), "letter.docx", b"definitely not a zip"))
            .await
            .unwrap();
        assert_eq!(records[0].extraction_status, ExtractionStatus::Failed);
        let text = records[0].content_text.as_deref().unwrap();
        assert!(text.contains("letter.docx"));
        assert!(text.contains("document"));
    }

    #[tokio::test]
    async fn encrypted_pdf_becomes_failed_record() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path());
        let records = d
            .dispatch(job(dir.path(), "locked.pdf", b"%PDF-1.6 /Encrypt 3 0 R"))
            .await
            .unwrap();
        assert_eq!(records[0].extraction_status, ExtractionStatus::Failed);
        assert!(records[0].content_text.as_deref().unwrap().contains("encrypted"));
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(ExtractionContext::new(
            Arc::new(TempResourceManager::new(dir.path())),
            Default::default(),
        ));
        let mut d = ExtractionDispatcher::new(ctx);
        d.register(Arc::new(PanickingHandler));

        let records = d.extract_leaf(&job(dir.path(), "x.boom", b"1")).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].extraction_status, ExtractionStatus::Failed);
    }

    #[tokio::test]
    async fn same_input_same_text() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path());
        let pdf = make_test_pdf(&["Discharge summary"]);
        let a = d.dispatch(job(dir.path(), "a.pdf", &pdf)).await.unwrap();
        let b = d.dispatch(job(dir.path(), "a.pdf", &pdf)).await.unwrap();
        assert_eq!(a[0].content_text, b[0].content_text);
        assert_ne!(a[0].record_id, b[0].record_id);
    }
}
