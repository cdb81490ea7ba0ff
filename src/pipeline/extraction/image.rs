//! Image files: described by the vision collaborator, optionally cropped to
//! the region it flagged.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use image::GenericImageView;
use tracing::Instrument;

use super::types::{
    ExtractionContext, ExtractionJob, FormatHandler, VisionDescriber, VisionDescription,
};
use super::{run_blocking, ExtractionError};
use crate::models::{BoundingBox, ExtractedRecord, RecordKind};
use crate::pipeline::import::{detect_image_mime, IMAGE_EXTENSIONS};

/// Call the vision collaborator with the run's per-call timeout.
pub async fn describe_image(
    ctx: &ExtractionContext,
    image: &[u8],
    mime_type: &str,
    label: &str,
) -> Result<VisionDescription, ExtractionError> {
    let vision = ctx.vision.as_ref().ok_or(ExtractionError::VisionUnavailable)?;
    let timeout = ctx.settings.vision_timeout;
    let span = tracing::info_span!("vision_describe", file = %label, image_size = image.len());
    let start = Instant::now();

    let result = tokio::time::timeout(timeout, vision.describe(image, mime_type))
        .instrument(span)
        .await;

    match result {
        Ok(Ok(description)) => {
            tracing::info!(
                file = %label,
                elapsed_ms = %start.elapsed().as_millis(),
                notable = description.has_notable_content,
                text_len = description.description.len(),
                "Vision description complete"
            );
            Ok(description)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ExtractionError::VisionTimeout {
            secs: timeout.as_secs(),
        }),
    }
}

/// MIME type from magic bytes, falling back to the extension.
pub fn image_mime(bytes: &[u8], extension: &str) -> String {
    detect_image_mime(bytes)
        .map(str::to_string)
        .unwrap_or_else(|| mime_guess::from_ext(extension).first_or_octet_stream().to_string())
}

/// Crop `bbox` out of `bytes` and write it as JPEG to `dest`.
pub fn crop_to_jpeg(bytes: &[u8], bbox: &BoundingBox, dest: &Path) -> Result<(), ExtractionError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| ExtractionError::ImageProcessing(format!("decode failed: {e}")))?;
    let (width, height) = img.dimensions();
    let (left, top, crop_w, crop_h) = bbox.to_pixel_rect(width, height).ok_or_else(|| {
        ExtractionError::ImageProcessing(format!("empty crop region {bbox:?} for {width}x{height}"))
    })?;

    img.crop_imm(left, top, crop_w, crop_h)
        .to_rgb8()
        .save_with_format(dest, image::ImageFormat::Jpeg)
        .map_err(|e| ExtractionError::ImageProcessing(format!("JPEG encoding failed: {e}")))
}

pub struct ImageHandler;

impl ImageHandler {
    async fn save_crop(
        &self,
        ctx: &ExtractionContext,
        bytes: Arc<Vec<u8>>,
        bbox: BoundingBox,
        record: &ExtractedRecord,
    ) -> Result<PathBuf, ExtractionError> {
        let dir = ctx.resources.create_persistent("image_crops")?;
        let dest = dir.path.join(format!("{}_crop.jpg", record.record_id));
        let target = dest.clone();
        let result = run_blocking(move || crop_to_jpeg(&bytes, &bbox, &target)).await;
        if result.is_err() {
            if let Err(e) = ctx.resources.release(dir.handle) {
                tracing::warn!(error = %e, "Failed to release unused crop directory");
            }
        }
        result.map(|()| dest)
    }
}

#[async_trait]
impl FormatHandler for ImageHandler {
    fn name(&self) -> &'static str {
        "image"
    }

    fn extensions(&self) -> &'static [&'static str] {
        IMAGE_EXTENSIONS
    }

    async fn extract(
        &self,
        job: &ExtractionJob,
        ctx: &Arc<ExtractionContext>,
    ) -> Result<Vec<ExtractedRecord>, ExtractionError> {
        let mut record = job.new_record(RecordKind::Document);
        let size = tokio::fs::metadata(&job.path).await?.len();
        if size == 0 {
            record.mark_empty("image file is empty");
            return Ok(vec![record]);
        }
        if size > ctx.settings.max_image_bytes {
            let limit_mb = ctx.settings.max_image_bytes / (1024 * 1024);
            record.mark_empty(&format!("image exceeds the {limit_mb} MB limit"));
            return Ok(vec![record]);
        }

        let bytes = Arc::new(tokio::fs::read(&job.path).await?);
        let mime = image_mime(&bytes, &job.extension);

        match describe_image(ctx, &bytes, &mime, &job.display_name).await {
            Ok(description) => {
                record.has_embedded_image = description.has_notable_content;
                record.bounding_box = description.bounding_box;
                if let (true, Some(bbox)) = (description.has_notable_content, description.bounding_box) {
                    match self.save_crop(ctx, bytes.clone(), bbox, &record).await {
                        Ok(path) => record.cropped_artifact_path = Some(path),
                        Err(e) => tracing::warn!(
                            file = %job.display_name,
                            error = %e,
                            "Could not crop flagged region"
                        ),
                    }
                }
                record.set_content(description.description.trim().to_string());
            }
            Err(e) => {
                tracing::warn!(file = %job.display_name, error = %e, "Vision description unavailable");
                record.mark_empty_with("image description unavailable", e.into());
            }
        }
        Ok(vec![record])
    }
}

// ── Mock for testing ──────────────────────────────────────

/// Scripted vision collaborator.
///
/// Returns the same description for every call unless told to fail.
/// Records how many calls it saw.
pub struct MockVisionDescriber {
    response: Option<VisionDescription>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockVisionDescriber {
    pub fn new(description: &str) -> Self {
        Self {
            response: Some(VisionDescription {
                has_notable_content: false,
                description: description.to_string(),
                bounding_box: None,
            }),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_region(mut self, bbox: BoundingBox) -> Self {
        if let Some(response) = self.response.as_mut() {
            response.has_notable_content = true;
            response.bounding_box = Some(bbox);
        }
        self
    }

    pub fn failing() -> Self {
        Self {
            response: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionDescriber for MockVisionDescriber {
    async fn describe(
        &self,
        _image: &[u8],
        _mime_type: &str,
    ) -> Result<VisionDescription, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.response
            .clone()
            .ok_or_else(|| ExtractionError::Vision("mock vision failure".into()))
    }
}

/// Encode a solid-color RGB image as PNG.
pub fn solid_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 30, 30]));
    let mut cursor = Cursor::new(Vec::new());
    // Encoding an in-memory RGB buffer cannot fail for PNG
    let _ = image::DynamicImage::ImageRgb8(img).write_to(&mut cursor, image::ImageOutputFormat::Png);
    cursor.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ErrorKind, ExtractionStatus, Lineage, Ordinal};
    use crate::pipeline::extraction::ExtractionSettings;
    use crate::pipeline::resources::TempResourceManager;

    fn ctx_with(root: &Path, vision: Option<MockVisionDescriber>) -> Arc<ExtractionContext> {
        let mut ctx = ExtractionContext::new(
            Arc::new(TempResourceManager::new(root)),
            ExtractionSettings {
                vision_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        );
        if let Some(v) = vision {
            ctx = ctx.with_vision(Arc::new(v));
        }
        Arc::new(ctx)
    }

    fn image_job(dir: &Path, name: &str, bytes: &[u8]) -> ExtractionJob {
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

    #[test]
    fn mime_prefers_magic_bytes() {
        assert_eq!(image_mime(&solid_png(2, 2), "jpg"), "image/png");
        assert_eq!(image_mime(&[0x00, 0x01], "webp"), "image/webp");
    }

    #[test]
    fn crop_writes_jpeg_of_region() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("crop.jpg");
        let bbox = BoundingBox { x: 0.5, y: 0.5, width: 0.5, height: 0.5 };
        crop_to_jpeg(&solid_png(40, 20), &bbox, &dest).unwrap();

        let cropped = image::open(&dest).unwrap();
        assert_eq!(cropped.dimensions(), (20, 10));
    }

    #[test]
    fn crop_rejects_undecodable_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let bbox = BoundingBox { x: 0.5, y: 0.5, width: 0.5, height: 0.5 };
        let err = crop_to_jpeg(b"nope", &bbox, &dir.path().join("x.jpg")).unwrap_err();
        assert!(matches!(err, ExtractionError::ImageProcessing(_)));
    }

    #[tokio::test]
    async fn described_image_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(dir.path(), Some(MockVisionDescriber::new("Chest X-ray, PA view")));
        let job = image_job(dir.path(), "photo.jpg", &solid_png(8, 8));

        let records = ImageHandler.extract(&job, &ctx).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_success());
        assert_eq!(records[0].content_text.as_deref(), Some("Chest X-ray, PA view"));
        assert!(records[0].cropped_artifact_path.is_none());
    }

    #[tokio::test]
    async fn flagged_region_is_cropped_to_persistent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let bbox = BoundingBox { x: 0.5, y: 0.5, width: 0.5, height: 0.5 };
        let vision = MockVisionDescriber::new("Ultrasound frame").with_region(bbox);
        let ctx = ctx_with(dir.path(), Some(vision));
        let job = image_job(dir.path(), "scan.png", &solid_png(16, 16));

        let records = ImageHandler.extract(&job, &ctx).await.unwrap();
        let record = &records[0];
        assert!(record.has_embedded_image);
        let crop = record.cropped_artifact_path.as_ref().unwrap();
        assert!(crop.exists());
        assert_eq!(ctx.resources.persistent_count(), 1);
    }

    #[tokio::test]
    async fn vision_failure_yields_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(dir.path(), Some(MockVisionDescriber::failing()));
        let job = image_job(dir.path(), "photo.jpg", &solid_png(4, 4));

        let records = ImageHandler.extract(&job, &ctx).await.unwrap();
        assert_eq!(records[0].extraction_status, ExtractionStatus::EmptyContent);
        assert!(records[0].content_text.as_deref().unwrap().contains("photo.jpg"));
        assert_eq!(records[0].extraction_error.as_ref().unwrap().kind, ErrorKind::Extraction);
    }

    #[tokio::test]
    async fn missing_vision_yields_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(dir.path(), None);
        let job = image_job(dir.path(), "photo.jpg", &solid_png(4, 4));

        let records = ImageHandler.extract(&job, &ctx).await.unwrap();
        assert_eq!(records[0].extraction_status, ExtractionStatus::EmptyContent);
    }

    #[tokio::test]
    async fn slow_vision_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let vision = MockVisionDescriber::new("late").with_delay(Duration::from_secs(5));
        let ctx = ctx_with(dir.path(), Some(vision));

        let err = describe_image(&ctx, &solid_png(2, 2), "image/png", "slow.png").await.unwrap_err();
        assert!(matches!(err, ExtractionError::VisionTimeout { .. }));
    }

    #[tokio::test]
    async fn empty_image_skips_vision() {
        let dir = tempfile::tempdir().unwrap();
        let vision = Arc::new(MockVisionDescriber::new("unused"));
        let ctx = Arc::new(
            ExtractionContext::new(Arc::new(TempResourceManager::new(dir.path())), Default::default())
                .with_vision(vision.clone()),
        );
        let job = image_job(dir.path(), "empty.png", &[]);

        let records = ImageHandler.extract(&job, &ctx).await.unwrap();
        assert_eq!(records[0].extraction_status, ExtractionStatus::EmptyContent);
        assert_eq!(vision.calls(), 0);
    }
}
