//! Office documents: docx via docx-rs, pptx by reading slide XML from the package.

use std::io::{Cursor, Read};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;

use super::sanitize::sanitize_extracted_text;
use super::types::{ExtractionContext, ExtractionJob, FormatHandler};
use super::{run_blocking, ExtractionError};
use crate::models::{ExtractedRecord, RecordKind};

static SLIDE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ppt/slides/slide(\d+)\.xml$").unwrap());
static NOTES_TARGET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"Target="(?:\.\./notesSlides/)?(notesSlide\d+\.xml)""#).unwrap());
static TEXT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<a:t(?:\s[^>]*)?>([^<]*)</a:t>").unwrap());

// ──────────────────────────────────────────────
// DOCX
// ──────────────────────────────────────────────

pub struct DocxHandler;

#[async_trait]
impl FormatHandler for DocxHandler {
    fn name(&self) -> &'static str {
        "docx"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["docx"]
    }

    async fn extract(
        &self,
        job: &ExtractionJob,
        _ctx: &Arc<ExtractionContext>,
    ) -> Result<Vec<ExtractedRecord>, ExtractionError> {
        let bytes = tokio::fs::read(&job.path).await?;
        let text = run_blocking(move || extract_docx_text(&bytes)).await?;
        let mut record = job.new_record(RecordKind::Document);
        record.set_content(text);
        Ok(vec![record])
    }
}

/// Paragraph text in document order; table rows as `cell | cell | cell`.
pub fn extract_docx_text(bytes: &[u8]) -> Result<String, ExtractionError> {
    let doc = docx_rs::read_docx(bytes).map_err(|e| ExtractionError::DocumentParsing {
        format: "docx",
        reason: e.to_string(),
    })?;

    let mut output = String::new();
    for child in &doc.document.children {
        match child {
            docx_rs::DocumentChild::Paragraph(para) => {
                output.push_str(&paragraph_text(para));
                output.push('\n');
            }
            docx_rs::DocumentChild::Table(table) => {
                for row in &table.rows {
                    let docx_rs::TableChild::TableRow(tr) = row;
                    let cells: Vec<String> = tr
                        .cells
                        .iter()
                        .map(|cell| {
                            let docx_rs::TableRowChild::TableCell(tc) = cell;
                            tc.children
                                .iter()
                                .filter_map(|c| match c {
                                    docx_rs::TableCellContent::Paragraph(p) => Some(paragraph_text(p)),
                                    _ => None,
                                })
                                .collect::<Vec<_>>()
                                .join(" ")
                                .trim()
                                .to_string()
                        })
                        .collect();
                    output.push_str(&cells.join(" | "));
                    output.push('\n');
                }
            }
            _ => {}
        }
    }
    Ok(sanitize_extracted_text(&output))
}

fn paragraph_text(para: &docx_rs::Paragraph) -> String {
    let mut text = String::new();
    for child in &para.children {
        match child {
            docx_rs::ParagraphChild::Run(run) => push_run_text(run, &mut text),
            docx_rs::ParagraphChild::Hyperlink(link) => {
                for inner in &link.children {
                    if let docx_rs::ParagraphChild::Run(run) = inner {
                        push_run_text(run, &mut text);
                    }
                }
            }
            _ => {}
        }
    }
    text
}

fn push_run_text(run: &docx_rs::Run, output: &mut String) {
    for run_child in &run.children {
        match run_child {
            docx_rs::RunChild::Text(t) => output.push_str(&t.text),
            docx_rs::RunChild::Tab(_) => output.push('\t'),
            _ => {}
        }
    }
}

// ──────────────────────────────────────────────
// PPTX
// ──────────────────────────────────────────────

pub struct PptxHandler;

#[async_trait]
impl FormatHandler for PptxHandler {
    fn name(&self) -> &'static str {
        "pptx"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["pptx"]
    }

    async fn extract(
        &self,
        job: &ExtractionJob,
        _ctx: &Arc<ExtractionContext>,
    ) -> Result<Vec<ExtractedRecord>, ExtractionError> {
        let bytes = tokio::fs::read(&job.path).await?;
        let text = run_blocking(move || extract_pptx_text(&bytes)).await?;
        let mut record = job.new_record(RecordKind::Document);
        record.set_content(text);
        Ok(vec![record])
    }
}

fn pptx_error<E: ToString>(reason: E) -> ExtractionError {
    ExtractionError::DocumentParsing {
        format: "pptx",
        reason: reason.to_string(),
    }
}

/// `=== Slide N ===` sections in slide order, with speaker notes when present.
pub fn extract_pptx_text(bytes: &[u8]) -> Result<String, ExtractionError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(pptx_error)?;

    let mut slides: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let number = SLIDE_NAME.captures(name)?.get(1)?.as_str().parse().ok()?;
            Some((number, name.to_string()))
        })
        .collect();
    if slides.is_empty() {
        return Err(pptx_error("no slides found"));
    }
    slides.sort_unstable_by_key(|(n, _)| *n);

    let mut sections = Vec::with_capacity(slides.len());
    for (number, name) in slides {
        let xml = read_entry(&mut archive, &name)?;
        let mut section = format!("=== Slide {number} ===\n{}", xml_paragraphs(&xml));

        let rels_name = format!("ppt/slides/_rels/slide{number}.xml.rels");
        if let Ok(rels) = read_entry(&mut archive, &rels_name) {
            if let Some(target) = NOTES_TARGET.captures(&rels).and_then(|c| c.get(1)) {
                let notes_name = format!("ppt/notesSlides/{}", target.as_str());
                if let Ok(notes_xml) = read_entry(&mut archive, &notes_name) {
                    let notes = xml_paragraphs(&notes_xml);
                    if !notes.trim().is_empty() {
                        section.push_str("\n[Notes] ");
                        section.push_str(&notes);
                    }
                }
            }
        }
        sections.push(section);
    }

    Ok(sanitize_extracted_text(&sections.join("\n\n")))
}

fn read_entry<R: Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
) -> Result<String, ExtractionError> {
    let mut entry = archive.by_name(name).map_err(pptx_error)?;
    let mut xml = String::new();
    entry.read_to_string(&mut xml)?;
    Ok(xml)
}

/// Text runs grouped by `<a:p>` paragraph, one line per paragraph.
fn xml_paragraphs(xml: &str) -> String {
    xml.split("</a:p>")
        .map(|para| {
            TEXT_RUN
                .captures_iter(para)
                .filter_map(|c| c.get(1))
                .map(|m| unescape_xml(m.as_str()))
                .collect::<String>()
        })
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn unescape_xml(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ if entity.starts_with("#x") => u32::from_str_radix(&entity[2..], 16).ok().and_then(char::from_u32),
            _ if entity.starts_with('#') => entity[1..].parse().ok().and_then(char::from_u32),
            _ => None,
        };
        match decoded {
            Some(c) => out.push(c),
            None => out.push_str(&tail[..=semi]),
        }
        rest = &tail[semi + 1..];
    }
    out.push_str(rest);
    out
}

// ──────────────────────────────────────────────
// Legacy PPT
// ──────────────────────────────────────────────

/// Binary .ppt is not parsed; the record carries a conversion hint.
pub struct LegacyPptHandler;

#[async_trait]
impl FormatHandler for LegacyPptHandler {
    fn name(&self) -> &'static str {
        "ppt"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["ppt"]
    }

    async fn extract(
        &self,
        job: &ExtractionJob,
        _ctx: &Arc<ExtractionContext>,
    ) -> Result<Vec<ExtractedRecord>, ExtractionError> {
        let mut record = job.new_record(RecordKind::Document);
        record.mark_empty("legacy .ppt format is not supported, convert to .pptx");
        Ok(vec![record])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::models::{ExtractionStatus, Lineage, Ordinal};
    use crate::pipeline::resources::TempResourceManager;

    fn make_docx() -> Vec<u8> {
        use docx_rs::{Docx, Paragraph, Run, Table, TableCell, TableRow};

        let cell = |text: &str| TableCell::new().add_paragraph(Paragraph::new().add_run(Run::new().add_text(text)));
        let table = Table::new(vec![
            TableRow::new(vec![cell("Test"), cell("Result")]),
            TableRow::new(vec![cell("WBC"), cell("6.2")]),
        ]);

        let mut buf = Cursor::new(Vec::new());
        Docx::new()
            .add_paragraph(Paragraph::new().add_run(Run::new().add_text("Discharge summary")))
            .add_table(table)
            .build()
            .pack(&mut buf)
            .unwrap();
        buf.into_inner()
    }

    fn make_pptx(slides: &[(&str, Option<&str>)]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        for (i, (body, notes)) in slides.iter().enumerate() {
            let n = i + 1;
            zip.start_file(format!("ppt/slides/slide{n}.xml"), options).unwrap();
            write!(zip, "<p:sld><a:p><a:r><a:t>{body}</a:t></a:r></a:p></p:sld>").unwrap();
            if let Some(notes) = notes {
                zip.start_file(format!("ppt/slides/_rels/slide{n}.xml.rels"), options).unwrap();
                write!(zip, r#"<Relationships><Relationship Id="rId2" Target="../notesSlides/notesSlide{n}.xml"/></Relationships>"#).unwrap();
                zip.start_file(format!("ppt/notesSlides/notesSlide{n}.xml"), options).unwrap();
                write!(zip, "<p:notes><a:p><a:r><a:t>{notes}</a:t></a:r></a:p></p:notes>").unwrap();
            }
        }
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn docx_paragraphs_and_tables() {
        let text = extract_docx_text(&make_docx()).unwrap();
        assert!(text.starts_with("Discharge summary"));
        assert!(text.contains("Test | Result"));
        assert!(text.contains("WBC | 6.2"));
    }

    #[test]
    fn invalid_docx_errors() {
        let err = extract_docx_text(b"not a docx").unwrap_err();
        assert!(matches!(err, ExtractionError::DocumentParsing { format: "docx", .. }));
    }

    #[test]
    fn pptx_slides_in_numeric_order_with_notes() {
        let slides: Vec<(String, Option<&str>)> = (1..=10)
            .map(|i| (format!("Body {i}"), if i == 2 { Some("Ask about allergies") } else { None }))
            .collect();
        let refs: Vec<(&str, Option<&str>)> = slides.iter().map(|(b, n)| (b.as_str(), *n)).collect();
        let text = extract_pptx_text(&make_pptx(&refs)).unwrap();

        let slide2 = text.find("=== Slide 2 ===").unwrap();
        let slide10 = text.find("=== Slide 10 ===").unwrap();
        assert!(slide2 < slide10);
        assert!(text.contains("Body 2\n[Notes] Ask about allergies"));
    }

    #[test]
    fn pptx_unescapes_entities() {
        let text = extract_pptx_text(&make_pptx(&[("BP &lt; 140 &amp; HR &#62; 60", None)])).unwrap();
        assert!(text.contains("BP < 140 & HR > 60"));
    }

    #[test]
    fn pptx_without_slides_errors() {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("docProps/app.xml", zip::write::SimpleFileOptions::default()).unwrap();
        zip.write_all(b"<x/>").unwrap();
        let bytes = zip.finish().unwrap().into_inner();
        assert!(extract_pptx_text(&bytes).is_err());
    }

    #[test]
    fn unescape_leaves_unknown_entities() {
        assert_eq!(unescape_xml("a &nbsp; b"), "a &nbsp; b");
        assert_eq!(unescape_xml("x &amp"), "x &amp");
        assert_eq!(unescape_xml("&#x4E2D;"), "中");
    }

    #[tokio::test]
    async fn legacy_ppt_gets_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.ppt");
        std::fs::write(&path, [0xD0, 0xCF, 0x11, 0xE0]).unwrap();
        let ctx = Arc::new(ExtractionContext::new(
            Arc::new(TempResourceManager::new(dir.path())),
            Default::default(),
        ));
        let job = ExtractionJob {
            path,
            display_name: "old.ppt".into(),
            extension: "ppt".into(),
            declared_type: None,
            ordinal: Ordinal::root(0),
            lineage: Lineage::default(),
        };

        let records = LegacyPptHandler.extract(&job, &ctx).await.unwrap();
        assert_eq!(records[0].extraction_status, ExtractionStatus::EmptyContent);
        let text = records[0].content_text.as_deref().unwrap();
        assert!(text.contains("old.ppt"));
        assert!(text.contains("presentation"));
    }
}
