//! PDF extraction in two modes.
//!
//! - **Text-only**: a fixed chain of text extractors; the first one that
//!   yields non-empty, non-garbled text wins.
//! - **With images**: page text plus a rendered PNG of every page, each sent
//!   to the vision collaborator. Produces the PDF record followed by one
//!   `PageImage` child per rendered page.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use lopdf::content::Content;
use lopdf::Object;

use super::garbled::is_garbled;
use super::image::describe_image;
use super::sanitize::sanitize_extracted_text;
use super::types::{ExtractionContext, ExtractionJob, FormatHandler, PdfPageRenderer};
use super::{run_blocking, ExtractionError};
use crate::models::{ExtractedRecord, PdfMode, RecordKind};
use crate::pipeline::stage::ConcurrentStageRunner;

/// Text extraction methods, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdfTextMethod {
    PdfExtract,
    Lopdf,
    ContentStream,
}

impl PdfTextMethod {
    pub const CHAIN: [PdfTextMethod; 3] = [Self::PdfExtract, Self::Lopdf, Self::ContentStream];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PdfExtract => "pdf_extract",
            Self::Lopdf => "lopdf",
            Self::ContentStream => "content_stream",
        }
    }

    fn extract_pages(&self, pdf_bytes: &[u8]) -> Result<Vec<String>, ExtractionError> {
        match self {
            Self::PdfExtract => pdf_extract::extract_text_from_mem_by_pages(pdf_bytes)
                .map_err(|e| ExtractionError::PdfParsing(e.to_string())),
            Self::Lopdf => {
                let doc = load_document(pdf_bytes)?;
                Ok(doc
                    .get_pages()
                    .keys()
                    .map(|number| doc.extract_text(&[*number]).unwrap_or_default())
                    .collect())
            }
            Self::ContentStream => {
                let doc = load_document(pdf_bytes)?;
                doc.get_pages()
                    .values()
                    .map(|page_id| {
                        let raw = doc
                            .get_page_content(*page_id)
                            .map_err(|e| ExtractionError::PdfParsing(e.to_string()))?;
                        let content = Content::decode(&raw)
                            .map_err(|e| ExtractionError::PdfParsing(e.to_string()))?;
                        Ok(text_operators(&content))
                    })
                    .collect()
            }
        }
    }
}

fn load_document(pdf_bytes: &[u8]) -> Result<lopdf::Document, ExtractionError> {
    lopdf::Document::load_mem(pdf_bytes).map_err(|e| ExtractionError::PdfParsing(e.to_string()))
}

/// Literal strings shown by `Tj`, `TJ`, `'` and `"`, decoded as Latin-1.
fn text_operators(content: &Content) -> String {
    fn push_string(obj: &Object, out: &mut String) {
        if let Object::String(bytes, _) = obj {
            out.extend(bytes.iter().map(|b| *b as char));
        }
    }

    let mut out = String::new();
    for op in &content.operations {
        match op.operator.as_str() {
            "Tj" | "'" | "\"" => {
                if matches!(op.operator.as_str(), "'" | "\"") {
                    out.push('\n');
                }
                if let Some(last) = op.operands.last() {
                    push_string(last, &mut out);
                }
            }
            "TJ" => {
                if let Some(Object::Array(items)) = op.operands.first() {
                    for item in items {
                        push_string(item, &mut out);
                    }
                }
            }
            "T*" | "ET" => out.push('\n'),
            _ => {}
        }
    }
    out
}

/// Winning method and its per-page text.
#[derive(Debug, Clone)]
pub struct PdfText {
    pub method: PdfTextMethod,
    pub pages: Vec<String>,
}

/// Try each method in order. Parser panics are contained per method.
pub fn extract_text_chain(pdf_bytes: &[u8]) -> Option<PdfText> {
    for method in PdfTextMethod::CHAIN {
        let attempt = std::panic::catch_unwind(AssertUnwindSafe(|| method.extract_pages(pdf_bytes)));
        let pages = match attempt {
            Ok(Ok(pages)) => pages,
            Ok(Err(e)) => {
                tracing::debug!(method = method.as_str(), error = %e, "PDF text method failed");
                continue;
            }
            Err(_) => {
                tracing::warn!(method = method.as_str(), "PDF text method panicked");
                continue;
            }
        };

        let joined = format_pages(&pages);
        if joined.trim().is_empty() {
            tracing::debug!(method = method.as_str(), "PDF text method returned no text");
            continue;
        }
        if is_garbled(&joined) {
            tracing::warn!(method = method.as_str(), "PDF text looks garbled, trying next method");
            continue;
        }
        return Some(PdfText { method, pages });
    }
    None
}

/// `[Page N]` headed sections for pages that have text.
pub fn format_pages(pages: &[String]) -> String {
    pages
        .iter()
        .enumerate()
        .filter_map(|(i, text)| {
            let clean = sanitize_extracted_text(text);
            (!clean.is_empty()).then(|| format!("[Page {}]\n{clean}", i + 1))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Cheap trailer check; pdf parsers fail on these with unhelpful errors.
pub fn is_encrypted(pdf_bytes: &[u8]) -> bool {
    pdf_bytes.windows(8).any(|w| w == b"/Encrypt")
}

struct RenderedPage {
    number: u32,
    path: PathBuf,
}

/// Render every page to `page_N.png` in `dir`. Pages that fail to render or
/// write are skipped.
fn render_pages(
    renderer: &dyn PdfPageRenderer,
    pdf_bytes: &[u8],
    dir: &Path,
    dpi: u32,
) -> Result<Vec<RenderedPage>, ExtractionError> {
    let count = renderer.page_count(pdf_bytes)?;
    let mut rendered = Vec::with_capacity(count);
    for index in 0..count {
        let number = index as u32 + 1;
        let png = match renderer.render_page(pdf_bytes, index, dpi) {
            Ok(png) => png,
            Err(e) => {
                tracing::warn!(page = number, error = %e, "Skipping page that failed to render");
                continue;
            }
        };
        let path = dir.join(format!("page_{number}.png"));
        if let Err(e) = std::fs::write(&path, png) {
            tracing::warn!(page = number, error = %e, "Skipping page that could not be written");
            continue;
        }
        rendered.push(RenderedPage { number, path });
    }
    Ok(rendered)
}

pub struct PdfHandler;

impl PdfHandler {
    async fn extract_text_only(
        &self,
        job: &ExtractionJob,
        pdf_bytes: Arc<Vec<u8>>,
    ) -> Result<Vec<ExtractedRecord>, ExtractionError> {
        let chain = run_blocking(move || Ok(extract_text_chain(&pdf_bytes))).await?;
        let mut record = job.new_record(RecordKind::Document);
        match chain {
            Some(text) => {
                tracing::info!(
                    file = %job.display_name,
                    method = text.method.as_str(),
                    pages = text.pages.len(),
                    "PDF text extracted"
                );
                record.set_content(format_pages(&text.pages));
            }
            None => record.mark_empty("no extraction method produced readable text"),
        }
        Ok(vec![record])
    }

    async fn extract_with_images(
        &self,
        job: &ExtractionJob,
        ctx: &Arc<ExtractionContext>,
        pdf_bytes: Arc<Vec<u8>>,
        renderer: Arc<dyn PdfPageRenderer>,
    ) -> Result<Vec<ExtractedRecord>, ExtractionError> {
        let pages_dir = ctx.resources.create_persistent("pdf_pages")?;
        let (render_bytes, dir_path, dpi) = (pdf_bytes.clone(), pages_dir.path.clone(), ctx.settings.render_dpi);
        let rendered =
            run_blocking(move || render_pages(renderer.as_ref(), &render_bytes, &dir_path, dpi)).await;

        let rendered = match rendered {
            Ok(pages) if !pages.is_empty() => pages,
            outcome => {
                if let Err(e) = &outcome {
                    tracing::warn!(file = %job.display_name, error = %e, "Page rendering failed, using text-only mode");
                }
                if let Err(e) = ctx.resources.release(pages_dir.handle) {
                    tracing::warn!(error = %e, "Failed to release unused page directory");
                }
                return self.extract_text_only(job, pdf_bytes).await;
            }
        };

        let text_bytes = pdf_bytes.clone();
        let page_texts = run_blocking(move || {
            Ok(extract_text_chain(&text_bytes).map(|t| t.pages).unwrap_or_default())
        })
        .await?;

        let runner = ConcurrentStageRunner::new("pdf_page_vision", ctx.settings.page_vision_concurrency)?;
        let worker_ctx = ctx.clone();
        let label = job.display_name.clone();
        let mut outputs = runner
            .run(rendered, move |_, page: RenderedPage| {
                let ctx = worker_ctx.clone();
                let label = format!("{label} page {}", page.number);
                async move {
                    let described = match tokio::fs::read(&page.path).await {
                        Ok(png) => describe_image(&ctx, &png, "image/png", &label).await,
                        Err(e) => Err(ExtractionError::Io(e)),
                    };
                    (page, described)
                }
            })
            .await;
        outputs.sort_by_key(|o| o.index);

        let mut parent = job.new_record(RecordKind::Document);
        let stem = Path::new(&job.display_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());

        let mut image_sections = Vec::new();
        let mut children = Vec::new();
        for output in outputs {
            let Ok((page, described)) = output.result else {
                continue;
            };
            let mut child = ExtractedRecord::new(
                RecordKind::PageImage,
                format!("{stem}_page{}.png", page.number),
                "png",
                job.ordinal.child(page.number as usize),
                job.lineage.page_of(parent.record_id, page.number),
            );
            child.declared_type = Some("image/png".to_string());
            child.local_artifact_path = Some(page.path);
            child.is_persistent_artifact = true;
            child.artifact_available = true;
            child.artifact_handle = Some(pages_dir.handle);

            match described {
                Ok(description) => {
                    child.has_embedded_image = description.has_notable_content;
                    child.bounding_box = description.bounding_box;
                    let text = description.description.trim().to_string();
                    if !text.is_empty() {
                        image_sections.push(format!("[Page {} - full page image]\n{text}", page.number));
                    }
                    child.set_content(text);
                }
                Err(e) => {
                    tracing::warn!(file = %job.display_name, page = page.number, error = %e, "Page description unavailable");
                    child.mark_empty_with("page image description unavailable", e.into());
                }
            }
            children.push(child);
        }

        let mut sections = vec![format_pages(&page_texts)];
        sections.extend(image_sections);
        let content = sections
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        parent.has_embedded_image = children.iter().any(|c| c.has_embedded_image);
        parent.set_content(content);

        tracing::info!(
            file = %job.display_name,
            record_id = %parent.record_id,
            pages = children.len(),
            "PDF extracted with page images"
        );

        let mut records = Vec::with_capacity(children.len() + 1);
        records.push(parent);
        records.extend(children);
        Ok(records)
    }
}

#[async_trait]
impl FormatHandler for PdfHandler {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["pdf"]
    }

    async fn extract(
        &self,
        job: &ExtractionJob,
        ctx: &Arc<ExtractionContext>,
    ) -> Result<Vec<ExtractedRecord>, ExtractionError> {
        let pdf_bytes = Arc::new(tokio::fs::read(&job.path).await?);
        if is_encrypted(&pdf_bytes) {
            return Err(ExtractionError::PdfEncrypted);
        }

        match (ctx.settings.pdf_mode, ctx.renderer.clone()) {
            (PdfMode::WithImages, Some(renderer)) => {
                self.extract_with_images(job, ctx, pdf_bytes, renderer).await
            }
            (PdfMode::WithImages, None) => {
                tracing::warn!(file = %job.display_name, "No page renderer configured, using text-only mode");
                self.extract_text_only(job, pdf_bytes).await
            }
            (PdfMode::Default, _) => self.extract_text_only(job, pdf_bytes).await,
        }
    }
}

/// Generate a PDF with one text page per entry using lopdf.
#[cfg(test)]
pub(crate) fn make_test_pdf(pages: &[&str]) -> Vec<u8> {
    use lopdf::dictionary;
    use lopdf::{Document, Stream};

    let mut doc = Document::with_version("1.4");
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let pages_id = doc.new_object_id();

    let mut kids = Vec::new();
    for text in pages {
        let content = format!("BT /F1 12 Tf 100 700 Td ({text}) Tj ET");
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => font_id },
            },
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}
