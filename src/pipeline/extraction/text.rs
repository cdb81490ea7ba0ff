//! Plain-text family: txt, md, json, and the fallback for unknown extensions.

use std::sync::Arc;

use async_trait::async_trait;

use super::sanitize::sanitize_extracted_text;
use super::types::{ExtractionContext, ExtractionJob, FormatHandler};
use super::ExtractionError;
use crate::models::{ExtractedRecord, RecordKind};
use crate::pipeline::import::is_likely_text;

/// Decode text as UTF-8, falling back to GBK.
pub fn decode_text(bytes: &[u8]) -> Result<String, ExtractionError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Ok(text.to_string());
    }
    encoding_rs::GBK
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|t| t.into_owned())
        .ok_or_else(|| ExtractionError::EncodingError("neither UTF-8 nor GBK".into()))
}

pub struct TextHandler;

#[async_trait]
impl FormatHandler for TextHandler {
    fn name(&self) -> &'static str {
        "text"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["txt", "md"]
    }

    async fn extract(
        &self,
        job: &ExtractionJob,
        _ctx: &Arc<ExtractionContext>,
    ) -> Result<Vec<ExtractedRecord>, ExtractionError> {
        let bytes = tokio::fs::read(&job.path).await?;
        let mut record = job.new_record(RecordKind::Document);
        record.set_content(sanitize_extracted_text(&decode_text(&bytes)?));
        Ok(vec![record])
    }
}

/// JSON is pretty-printed so nested structure survives as readable text.
pub struct JsonHandler;

#[async_trait]
impl FormatHandler for JsonHandler {
    fn name(&self) -> &'static str {
        "json"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["json"]
    }

    async fn extract(
        &self,
        job: &ExtractionJob,
        _ctx: &Arc<ExtractionContext>,
    ) -> Result<Vec<ExtractedRecord>, ExtractionError> {
        let bytes = tokio::fs::read(&job.path).await?;
        let raw = decode_text(&bytes)?;
        let text = match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(value) => serde_json::to_string_pretty(&value).unwrap_or(raw),
            Err(e) => {
                tracing::debug!(file = %job.display_name, error = %e, "Invalid JSON, keeping raw text");
                raw
            }
        };
        let mut record = job.new_record(RecordKind::Document);
        record.set_content(text.trim().to_string());
        Ok(vec![record])
    }
}

/// Fallback for extensions no other handler claims.
pub struct PassthroughHandler;

#[async_trait]
impl FormatHandler for PassthroughHandler {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[]
    }

    async fn extract(
        &self,
        job: &ExtractionJob,
        _ctx: &Arc<ExtractionContext>,
    ) -> Result<Vec<ExtractedRecord>, ExtractionError> {
        let bytes = tokio::fs::read(&job.path).await?;
        let mut record = job.new_record(RecordKind::Document);

        if bytes.is_empty() {
            record.mark_empty("file is empty");
        } else if is_likely_text(&bytes) {
            match decode_text(&bytes) {
                Ok(text) => record.set_content(sanitize_extracted_text(&text)),
                Err(_) => record.mark_empty("text encoding not recognized"),
            }
        } else {
            record.mark_empty("binary format, no text extracted");
        }
        Ok(vec![record])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtractionStatus, Lineage, Ordinal};
    use crate::pipeline::resources::TempResourceManager;

    fn ctx(root: &std::path::Path) -> Arc<ExtractionContext> {
        Arc::new(ExtractionContext::new(
            Arc::new(TempResourceManager::new(root)),
            Default::default(),
        ))
    }

    fn job(path: std::path::PathBuf, ext: &str) -> ExtractionJob {
        ExtractionJob {
            display_name: path.file_name().unwrap().to_string_lossy().into_owned(),
            path,
            extension: ext.into(),
            declared_type: None,
            ordinal: Ordinal::root(0),
            lineage: Lineage::default(),
        }
    }

    #[test]
    fn decode_utf8_with_bom() {
        assert_eq!(decode_text(b"\xEF\xBB\xBFHello").unwrap(), "Hello");
    }

    #[test]
    fn decode_falls_back_to_gbk() {
        let (encoded, _, _) = encoding_rs::GBK.encode("体检报告");
        assert_eq!(decode_text(&encoded).unwrap(), "体检报告");
    }

    #[test]
    fn decode_rejects_invalid_bytes() {
        assert!(decode_text(&[0xFF, 0xFF, 0xFF]).is_err());
    }

    #[tokio::test]
    async fn text_handler_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readme.txt");
        std::fs::write(&path, "Follow-up in 3 months.\n\n\nBring prior imaging.").unwrap();

        let records = TextHandler.extract(&job(path, "txt"), &ctx(dir.path())).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].extraction_status, ExtractionStatus::Success);
        assert_eq!(
            records[0].content_text.as_deref(),
            Some("Follow-up in 3 months.\nBring prior imaging.")
        );
    }

    #[tokio::test]
    async fn empty_text_file_is_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank.md");
        std::fs::write(&path, "  \n").unwrap();

        let records = TextHandler.extract(&job(path, "md"), &ctx(dir.path())).await.unwrap();
        assert_eq!(records[0].extraction_status, ExtractionStatus::EmptyContent);
        assert!(records[0].content_text.as_deref().unwrap().contains("blank.md"));
    }

    #[tokio::test]
    async fn json_is_pretty_printed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labs.json");
        std::fs::write(&path, r#"{"wbc":6.2}"#).unwrap();

        let records = JsonHandler.extract(&job(path, "json"), &ctx(dir.path())).await.unwrap();
        assert_eq!(records[0].content_text.as_deref(), Some("{\n  \"wbc\": 6.2\n}"));
    }

    #[tokio::test]
    async fn invalid_json_keeps_raw_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();

        let records = JsonHandler.extract(&job(path, "json"), &ctx(dir.path())).await.unwrap();
        assert_eq!(records[0].content_text.as_deref(), Some("{not json"));
    }

    #[tokio::test]
    async fn passthrough_decodes_text_and_skips_binary() {
        let dir = tempfile::tempdir().unwrap();
        let text_path = dir.path().join("notes.log");
        std::fs::write(&text_path, "BP 120/80").unwrap();
        let bin_path = dir.path().join("device.dat");
        std::fs::write(&bin_path, [0x00, 0x9F, 0x92, 0x96, 0x00]).unwrap();

        let ctx = ctx(dir.path());
        let text = PassthroughHandler.extract(&job(text_path, "log"), &ctx).await.unwrap();
        assert_eq!(text[0].content_text.as_deref(), Some("BP 120/80"));

        let bin = PassthroughHandler.extract(&job(bin_path, "dat"), &ctx).await.unwrap();
        assert_eq!(bin[0].extraction_status, ExtractionStatus::EmptyContent);
        let placeholder = bin[0].content_text.as_deref().unwrap();
        assert!(placeholder.contains("device.dat"));
        assert!(placeholder.contains("other"));
    }
}
