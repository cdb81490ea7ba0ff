//! Recursive ZIP decomposition.
//!
//! An archive is unpacked into a scratch directory that lives exactly as long
//! as the decomposition call. Leaf entries go through the dispatcher on one
//! bounded pool, nested archives recurse on a second, smaller pool. Entries
//! that will be uploaded later are copied into a per-archive persistent
//! directory that outlives the call.

pub mod names;
pub mod visited;

pub use names::*;
pub use visited::*;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ErrorKind, ExtractedRecord, ExtractionStatus, RecordError, RecordKind};
use crate::pipeline::extraction::{ExtractionDispatcher, ExtractionJob};
use crate::pipeline::import::{
    resolve_extension, sanitize_filename, ARCHIVE_EXTENSION, ARCHIVE_LEAF_EXTENSIONS,
    PERSISTENT_EXTENSIONS,
};
use crate::pipeline::resources::{PersistentDir, ResourceError};
use crate::pipeline::stage::{ConcurrencyError, ConcurrentStageRunner, StageOutput};

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Could not open archive: {0}")]
    Open(String),

    #[error("Archive nesting exceeds {max} levels")]
    TooDeep { max: usize },

    #[error("Archive unpacks to more than {max} bytes")]
    TooLarge { max: u64 },

    #[error("Archive {0} is already open on this branch")]
    Cycle(String),

    #[error("I/O error while unpacking: {0}")]
    Io(#[from] std::io::Error),

    #[error("Temp resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    #[error("Unpacking task failed: {0}")]
    Task(String),
}

impl From<ArchiveError> for RecordError {
    fn from(e: ArchiveError) -> Self {
        let kind = match &e {
            ArchiveError::Cycle(_) => ErrorKind::DuplicateArchive,
            ArchiveError::Resource(_) => ErrorKind::Resource,
            _ => ErrorKind::Archive,
        };
        RecordError::new(kind, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryClass {
    Leaf,
    Nested,
    Unsupported,
}

impl EntryClass {
    pub fn of(extension: &str) -> Self {
        if extension == ARCHIVE_EXTENSION {
            Self::Nested
        } else if ARCHIVE_LEAF_EXTENSIONS.contains(&extension) {
            Self::Leaf
        } else {
            Self::Unsupported
        }
    }
}

/// One file written to the scratch directory.
#[derive(Debug, Clone)]
pub struct UnpackedEntry {
    /// Decoded path inside the archive.
    pub name: String,
    pub display_name: String,
    pub path: PathBuf,
    pub extension: String,
    pub class: EntryClass,
}

#[derive(Debug, Default)]
pub struct UnpackReport {
    /// In the archive's own entry order.
    pub entries: Vec<UnpackedEntry>,
    pub undecodable: usize,
    pub unsafe_paths: usize,
    pub unreadable: usize,
}

/// Unpack `archive` into `dest`. Blocking.
///
/// Entries with undecodable names, unsafe paths or read/write errors are
/// skipped and counted; hidden/system entries are skipped silently. Fails the
/// whole archive once more than `max_bytes` would be written.
pub fn unpack(archive: &Path, dest: &Path, max_bytes: u64) -> Result<UnpackReport, ArchiveError> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| ArchiveError::Open(e.to_string()))?;
    let mut report = UnpackReport::default();
    let mut written: u64 = 0;

    for index in 0..zip.len() {
        let mut entry = match zip.by_index(index) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(index, error = %e, "Unreadable archive entry");
                report.unreadable += 1;
                continue;
            }
        };
        if entry.is_dir() {
            continue;
        }

        let Some((name, encoding)) = decode_entry_name(entry.name_raw()) else {
            tracing::warn!(
                raw = %String::from_utf8_lossy(entry.name_raw()),
                "Skipping entry with undecodable name"
            );
            report.undecodable += 1;
            continue;
        };
        let Some(relative) = safe_relative_path(&name) else {
            tracing::warn!(entry = %name, "Skipping entry with unsafe path");
            report.unsafe_paths += 1;
            continue;
        };
        if is_hidden_entry(&relative) {
            continue;
        }

        let remaining = max_bytes.saturating_sub(written);
        if entry.size() > remaining {
            return Err(ArchiveError::TooLarge { max: max_bytes });
        }

        let target = unique_target(dest, &relative, index);
        let copied = match write_entry(&mut entry, &target, remaining) {
            Ok(copied) => copied,
            Err(e) => {
                tracing::warn!(entry = %name, error = %e, "Failed to unpack entry");
                let _ = std::fs::remove_file(&target);
                report.unreadable += 1;
                continue;
            }
        };
        // declared sizes can lie
        if copied > remaining {
            let _ = std::fs::remove_file(&target);
            return Err(ArchiveError::TooLarge { max: max_bytes });
        }
        written += copied;

        let display_name = sanitize_filename(&name);
        let extension = resolve_extension(&display_name, &read_header(&target));
        tracing::debug!(entry = %name, encoding, extension = %extension, "Unpacked entry");
        report.entries.push(UnpackedEntry {
            class: EntryClass::of(&extension),
            name,
            display_name,
            path: target,
            extension,
        });
    }

    Ok(report)
}

/// Copy at most `limit + 1` bytes of `entry` to `target`.
fn write_entry(entry: &mut impl Read, target: &Path, limit: u64) -> std::io::Result<u64> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = File::create(target)?;
    std::io::copy(&mut entry.take(limit.saturating_add(1)), &mut out)
}

/// Same-named entries get the entry index appended to the stem.
fn unique_target(dest: &Path, relative: &Path, index: usize) -> PathBuf {
    let target = dest.join(relative);
    if !target.exists() {
        return target;
    }
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let renamed = match target.extension() {
        Some(ext) => format!("{stem}_{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{index}"),
    };
    target.with_file_name(renamed)
}

pub(crate) fn read_header(path: &Path) -> Vec<u8> {
    let mut header = Vec::with_capacity(16);
    if let Ok(file) = File::open(path) {
        let _ = file.take(16).read_to_end(&mut header);
    }
    header
}

/// Records produced by one archive plus the archive keys it entered.
#[derive(Debug, Default)]
pub struct Decomposition {
    pub records: Vec<ExtractedRecord>,
    pub visited_additions: Vec<ArchiveKey>,
}

struct Expansion {
    report: UnpackReport,
    records: Vec<ExtractedRecord>,
    additions: Vec<ArchiveKey>,
}

#[derive(Clone)]
pub struct ArchiveDecomposer {
    dispatcher: Arc<ExtractionDispatcher>,
}

impl ArchiveDecomposer {
    pub fn new(dispatcher: Arc<ExtractionDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Decompose the archive at `job.path`.
    ///
    /// `visited` is the snapshot of archives open on this branch; `depth` is
    /// 0 for a top-level archive. Always yields at least one record.
    pub fn decompose(
        &self,
        job: ExtractionJob,
        visited: VisitedArchives,
        depth: usize,
    ) -> BoxFuture<'static, Decomposition> {
        let this = self.clone();
        async move { this.decompose_inner(job, visited, depth).await }.boxed()
    }

    async fn decompose_inner(
        &self,
        job: ExtractionJob,
        visited: VisitedArchives,
        depth: usize,
    ) -> Decomposition {
        let max_depth = self.dispatcher.context().settings.max_archive_depth;
        let mut summary = job.new_record(RecordKind::ArchiveSummary);

        let path = job.path.clone();
        let identity = match tokio::task::spawn_blocking(move || ArchiveIdentity::of(&path)).await {
            Ok(identity) => identity,
            Err(e) => {
                summary.mark_failed(ArchiveError::Task(e.to_string()).into());
                return Decomposition {
                    records: vec![summary],
                    visited_additions: Vec::new(),
                };
            }
        };

        if visited.contains(&identity) {
            tracing::warn!(archive = %job.display_name, depth, "Archive cycle detected, not expanding");
            let mut marker = job.new_record(RecordKind::DuplicateArchive);
            marker.mark_empty_with(
                "archive is already being expanded on this branch",
                ArchiveError::Cycle(job.display_name.clone()).into(),
            );
            return Decomposition {
                records: vec![marker],
                visited_additions: Vec::new(),
            };
        }

        if depth > max_depth {
            tracing::warn!(archive = %job.display_name, depth, max_depth, "Archive nested too deep");
            summary.mark_failed(ArchiveError::TooDeep { max: max_depth }.into());
            return Decomposition {
                records: vec![summary],
                visited_additions: Vec::new(),
            };
        }

        let mut additions = identity.keys();
        let branch = visited.with(additions.clone());
        let start = std::time::Instant::now();

        let records = match self.expand(&job, summary.record_id, branch, depth).await {
            Ok(expansion) => {
                write_summary(&mut summary, &job, &expansion);
                additions.extend(expansion.additions);
                expansion.records
            }
            Err(e) => {
                tracing::warn!(archive = %job.display_name, error = %e, "Archive could not be expanded");
                summary.mark_failed(e.into());
                Vec::new()
            }
        };

        tracing::info!(
            archive = %job.display_name,
            record_id = %summary.record_id,
            depth,
            records = records.len(),
            elapsed_ms = %start.elapsed().as_millis(),
            "Archive decomposed"
        );

        let mut all = Vec::with_capacity(records.len() + 1);
        all.push(summary);
        all.extend(records);
        Decomposition {
            records: all,
            visited_additions: additions,
        }
    }

    async fn expand(
        &self,
        job: &ExtractionJob,
        archive_id: Uuid,
        branch: VisitedArchives,
        depth: usize,
    ) -> Result<Expansion, ArchiveError> {
        let ctx = self.dispatcher.context().clone();
        let scratch = ctx.resources.scratch("zip")?;

        let (source, dest) = (job.path.clone(), scratch.path().to_path_buf());
        let max_bytes = ctx.settings.max_unpacked_bytes;
        let report = tokio::task::spawn_blocking(move || unpack(&source, &dest, max_bytes))
            .await
            .map_err(|e| ArchiveError::Task(e.to_string()))??;

        let lineage = job.lineage.descend_into_archive(archive_id, &job.display_name);
        let mut leaves = Vec::new();
        let mut nested = Vec::new();
        for (index, entry) in report.entries.iter().enumerate() {
            let child = ExtractionJob {
                path: entry.path.clone(),
                display_name: entry.display_name.clone(),
                extension: entry.extension.clone(),
                declared_type: None,
                ordinal: job.ordinal.child(index),
                lineage: lineage.clone(),
            };
            match entry.class {
                EntryClass::Leaf => leaves.push(child),
                EntryClass::Nested => nested.push(child),
                EntryClass::Unsupported => {
                    tracing::debug!(archive = %job.display_name, entry = %entry.name, "Unsupported entry listed only")
                }
            }
        }

        let upload_dir = if leaves
            .iter()
            .any(|j| PERSISTENT_EXTENSIONS.contains(&j.extension.as_str()))
        {
            match ctx.resources.create_persistent("zip_upload") {
                Ok(dir) => Some(dir),
                Err(e) => {
                    tracing::warn!(archive = %job.display_name, error = %e, "No persistent directory for archive artifacts");
                    None
                }
            }
        } else {
            None
        };

        let mut records = self.extract_leaves(leaves, upload_dir.clone()).await?;
        if let Some(dir) = &upload_dir {
            if let Err(e) = ctx.resources.release_if_empty(dir.handle) {
                tracing::warn!(error = %e, "Failed to release empty archive artifact directory");
            }
        }

        let (nested_records, additions) = self.expand_nested(nested, branch, depth).await?;
        records.extend(nested_records);

        drop(scratch);
        Ok(Expansion {
            report,
            records,
            additions,
        })
    }

    async fn extract_leaves(
        &self,
        leaves: Vec<ExtractionJob>,
        upload_dir: Option<PersistentDir>,
    ) -> Result<Vec<ExtractedRecord>, ArchiveError> {
        if leaves.is_empty() {
            return Ok(Vec::new());
        }
        let limit = self.dispatcher.context().settings.archive_entry_concurrency;
        let runner = ConcurrentStageRunner::new("archive_entries", limit)?;
        let jobs = leaves.clone();
        let dispatcher = self.dispatcher.clone();

        let outputs = runner
            .run(leaves, move |_, job: ExtractionJob| {
                let dispatcher = dispatcher.clone();
                let upload_dir = upload_dir.clone();
                async move {
                    let mut records = dispatcher.extract_leaf(&job).await;
                    if let Some(first) = records.first_mut() {
                        keep_artifact(first, &job, upload_dir.as_ref()).await;
                    }
                    records
                }
            })
            .await;

        Ok(flatten_outputs(outputs, &jobs, |records| records))
    }

    async fn expand_nested(
        &self,
        nested: Vec<ExtractionJob>,
        branch: VisitedArchives,
        depth: usize,
    ) -> Result<(Vec<ExtractedRecord>, Vec<ArchiveKey>), ArchiveError> {
        if nested.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let limit = self.dispatcher.context().settings.nested_archive_concurrency;
        let runner = ConcurrentStageRunner::new("nested_archives", limit)?;
        let jobs = nested.clone();
        let decomposer = self.clone();

        let outputs = runner
            .run(nested, move |_, job: ExtractionJob| {
                decomposer.decompose(job, branch.clone(), depth + 1)
            })
            .await;

        let mut additions = Vec::new();
        let records = flatten_outputs(outputs, &jobs, |decomposition| {
            additions.extend(decomposition.visited_additions);
            decomposition.records
        });
        Ok((records, additions))
    }
}

/// Copy a leaf's source file into the archive's persistent directory.
/// On failure the scratch path is kept and marked unavailable.
async fn keep_artifact(record: &mut ExtractedRecord, job: &ExtractionJob, dir: Option<&PersistentDir>) {
    if !PERSISTENT_EXTENSIONS.contains(&job.extension.as_str()) {
        return;
    }
    let copied = match dir {
        Some(dir) => {
            let dest = dir.path.join(format!("{}.{}", record.record_id, job.extension));
            match tokio::fs::copy(&job.path, &dest).await {
                Ok(_) => Some((dest, dir.handle)),
                Err(e) => {
                    tracing::warn!(file = %job.display_name, error = %e, "Failed to keep archive artifact");
                    None
                }
            }
        }
        None => None,
    };

    match copied {
        Some((path, handle)) => {
            record.local_artifact_path = Some(path);
            record.is_persistent_artifact = true;
            record.artifact_available = true;
            record.artifact_handle = Some(handle);
        }
        None => {
            record.local_artifact_path = Some(job.path.clone());
            record.is_persistent_artifact = false;
            record.artifact_available = false;
        }
    }
}

/// Order pool outputs by entry and turn worker panics into Failed records.
fn flatten_outputs<T>(
    mut outputs: Vec<StageOutput<T>>,
    jobs: &[ExtractionJob],
    mut take: impl FnMut(T) -> Vec<ExtractedRecord>,
) -> Vec<ExtractedRecord> {
    outputs.sort_by_key(|o| o.index);
    let mut records = Vec::new();
    for output in outputs {
        match output.result {
            Ok(value) => records.extend(take(value)),
            Err(e) => {
                let Some(job) = jobs.get(output.index) else {
                    continue;
                };
                let mut record = job.new_record(RecordKind::Document);
                record.mark_failed(RecordError::new(ErrorKind::Extraction, e.to_string()));
                records.push(record);
            }
        }
    }
    records
}

fn write_summary(summary: &mut ExtractedRecord, job: &ExtractionJob, expansion: &Expansion) {
    let report = &expansion.report;
    if report.entries.is_empty() {
        summary.mark_empty("archive contains no extractable files");
        return;
    }

    let depth = job.ordinal.0.len() + 1;
    let direct: Vec<_> = expansion
        .records
        .iter()
        .filter(|r| r.ordinal.0.len() == depth && r.kind == RecordKind::Document)
        .collect();
    let failed = direct
        .iter()
        .filter(|r| r.extraction_status == ExtractionStatus::Failed)
        .count();
    let count = |class: EntryClass| report.entries.iter().filter(|e| e.class == class).count();

    let mut text = format!(
        "Archive: {}\nEntries: {} (extracted {}, failed {}, nested archives {}, unsupported {})",
        job.display_name,
        report.entries.len(),
        direct.len() - failed,
        failed,
        count(EntryClass::Nested),
        count(EntryClass::Unsupported),
    );
    let skipped = report.undecodable + report.unsafe_paths + report.unreadable;
    if skipped > 0 {
        text.push_str(&format!(
            "\nSkipped: {} undecodable names, {} unsafe paths, {} unreadable",
            report.undecodable, report.unsafe_paths, report.unreadable
        ));
    }
    text.push_str("\nFiles:");
    for entry in &report.entries {
        match entry.class {
            EntryClass::Unsupported => text.push_str(&format!("\n- {} (unsupported)", entry.name)),
            _ => text.push_str(&format!("\n- {}", entry.name)),
        }
    }
    summary.set_content(text);
}

/// Build an in-memory ZIP from `(name, bytes)` pairs.
#[cfg(test)]
pub(crate) fn make_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::{Cursor, Write};

    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, bytes) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(bytes).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Lineage, Ordinal};
    use crate::pipeline::extraction::image::solid_png;
    use crate::pipeline::extraction::pdf::make_test_pdf;
    use crate::pipeline::extraction::{ExtractionContext, ExtractionSettings};
    use crate::pipeline::resources::{TempResourceManager, SCRATCH_PREFIX};

    struct Fixture {
        _root: tempfile::TempDir,
        inputs: PathBuf,
        resources: Arc<TempResourceManager>,
        decomposer: ArchiveDecomposer,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_settings(ExtractionSettings::default())
        }

        fn with_settings(settings: ExtractionSettings) -> Self {
            let root = tempfile::tempdir().unwrap();
            let inputs = root.path().join("inputs");
            std::fs::create_dir_all(&inputs).unwrap();
            let resources = Arc::new(TempResourceManager::new(root.path().join("tmp")));
            let ctx = Arc::new(ExtractionContext::new(resources.clone(), settings));
            let dispatcher = Arc::new(ExtractionDispatcher::new(ctx));
            Self {
                _root: root,
                inputs,
                resources,
                decomposer: ArchiveDecomposer::new(dispatcher),
            }
        }

        fn job(&self, name: &str, bytes: &[u8]) -> ExtractionJob {
            let path = self.inputs.join(name);
            std::fs::write(&path, bytes).unwrap();
            ExtractionJob {
                path,
                display_name: name.into(),
                extension: "zip".into(),
                declared_type: None,
                ordinal: Ordinal::root(0),
                lineage: Lineage::default(),
            }
        }

        async fn run(&self, name: &str, bytes: &[u8]) -> Decomposition {
            self.decomposer
                .decompose(self.job(name, bytes), VisitedArchives::default(), 0)
                .await
        }

        fn scratch_dirs_left(&self) -> usize {
            std::fs::read_dir(self.resources.root())
                .map(|entries| {
                    entries
                        .filter_map(Result::ok)
                        .filter(|e| {
                            e.file_name()
                                .to_string_lossy()
                                .starts_with(&format!("{SCRATCH_PREFIX}_zip_"))
                        })
                        .count()
                })
                .unwrap_or(0)
        }
    }

    fn by_name<'a>(records: &'a [ExtractedRecord], name: &str) -> &'a ExtractedRecord {
        records
            .iter()
            .find(|r| r.display_name == name)
            .unwrap_or_else(|| panic!("no record named {name}"))
    }

    #[tokio::test]
    async fn expands_entries_with_lineage_and_summary() {
        let f = Fixture::new();
        let zip = make_zip(&[
            ("report.pdf", &make_test_pdf(&["Hemoglobin 132 g/L"])),
            ("photo.jpg", &solid_png(8, 8)),
            ("notes.txt", b"Follow-up in two weeks"),
            ("scan.dcm", b"DICM"),
        ]);

        let out = f.run("caseA.zip", &zip).await;
        let summary = &out.records[0];
        assert_eq!(summary.kind, RecordKind::ArchiveSummary);
        assert!(summary.is_success());
        let text = summary.content_text.as_deref().unwrap();
        assert!(text.contains("Entries: 4"));
        assert!(text.contains("- scan.dcm (unsupported)"));

        // unsupported entries appear only in the summary
        assert_eq!(out.records.len(), 4);
        assert!(out.records.iter().all(|r| r.display_name != "scan.dcm"));

        for name in ["report.pdf", "photo.jpg", "notes.txt"] {
            let r = by_name(&out.records, name);
            assert_eq!(r.lineage.source_archive_id, Some(summary.record_id));
            assert_eq!(r.lineage.source_archive_name.as_deref(), Some("caseA.zip"));
            assert_eq!(r.ordinal.0.len(), 2);
        }
        assert_eq!(out.visited_additions.len(), 2);
    }

    #[tokio::test]
    async fn uploadable_entries_get_persistent_copies() {
        let f = Fixture::new();
        let zip = make_zip(&[
            ("report.pdf", &make_test_pdf(&["Impression: normal"])),
            ("notes.txt", b"plain"),
        ]);
        let out = f.run("case.zip", &zip).await;

        let pdf = by_name(&out.records, "report.pdf");
        let path = pdf.local_artifact_path.as_ref().unwrap();
        assert!(pdf.is_persistent_artifact);
        assert!(pdf.artifact_available);
        assert!(path.exists());
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            format!("{}.pdf", pdf.record_id)
        );
        assert_eq!(f.resources.path_of(pdf.artifact_handle.unwrap()).as_deref(), path.parent());

        let txt = by_name(&out.records, "notes.txt");
        assert!(txt.local_artifact_path.is_none());
        assert!(!txt.is_persistent_artifact);

        assert_eq!(f.scratch_dirs_left(), 0);
    }

    #[tokio::test]
    async fn ordinals_follow_archive_entry_order() {
        let f = Fixture::new();
        let zip = make_zip(&[
            ("report.pdf", &make_test_pdf(&["Creatinine 88"])),
            ("photo.jpg", &solid_png(4, 4)),
            ("a_notes.txt", b"seen last"),
        ]);
        let out = f.run("caseA.zip", &zip).await;
        let root = Ordinal::root(0);

        assert_eq!(by_name(&out.records, "report.pdf").ordinal, root.child(0));
        assert_eq!(by_name(&out.records, "photo.jpg").ordinal, root.child(1));
        assert_eq!(by_name(&out.records, "a_notes.txt").ordinal, root.child(2));
    }

    #[tokio::test]
    async fn conflicting_entry_does_not_fail_siblings() {
        let f = Fixture::new();
        // second entry needs a directory where a file already sits
        let zip = make_zip(&[
            ("notes.txt", b"first"),
            ("notes.txt/inner.txt", b"nested"),
            ("ok.txt", b"fine"),
        ]);
        let out = f.run("clash.zip", &zip).await;

        let summary = &out.records[0];
        assert_eq!(summary.extraction_status, ExtractionStatus::Success);
        let text = summary.content_text.as_deref().unwrap();
        assert!(text.contains("Entries: 2"));
        assert!(text.contains("1 unreadable"));
        assert_eq!(out.records.len(), 3);
        assert!(by_name(&out.records, "notes.txt").is_success());
        assert!(by_name(&out.records, "ok.txt").is_success());
        assert_eq!(f.scratch_dirs_left(), 0);
    }

    #[tokio::test]
    async fn archive_over_byte_limit_fails_and_cleans_up() {
        let f = Fixture::with_settings(ExtractionSettings {
            max_unpacked_bytes: 16,
            ..Default::default()
        });
        let zip = make_zip(&[("big.txt", &[b'x'; 100])]);
        let out = f.run("bomb.zip", &zip).await;

        assert_eq!(out.records.len(), 1);
        let summary = &out.records[0];
        assert_eq!(summary.extraction_status, ExtractionStatus::Failed);
        assert_eq!(summary.extraction_error.as_ref().unwrap().kind, ErrorKind::Archive);
        assert!(summary.extraction_error.as_ref().unwrap().message.contains("16 bytes"));
        assert_eq!(f.scratch_dirs_left(), 0);
    }

    #[tokio::test]
    async fn text_only_archive_leaves_no_persistent_dir() {
        let f = Fixture::new();
        let zip = make_zip(&[("a.txt", b"one"), ("b.md", b"two")]);
        f.run("texts.zip", &zip).await;
        assert_eq!(f.resources.persistent_count(), 0);
        assert_eq!(f.scratch_dirs_left(), 0);
    }

    #[tokio::test]
    async fn nested_archives_propagate_lineage() {
        let f = Fixture::new();
        let inner = make_zip(&[("a.txt", b"inner text")]);
        let outer = make_zip(&[("inner.zip", &inner), ("b.txt", b"outer text")]);

        let out = f.run("outer.zip", &outer).await;
        let outer_summary = &out.records[0];
        let inner_summary = by_name(&out.records, "inner.zip");
        assert_eq!(inner_summary.kind, RecordKind::ArchiveSummary);
        assert_eq!(inner_summary.lineage.source_archive_id, Some(outer_summary.record_id));

        let a = by_name(&out.records, "a.txt");
        assert_eq!(a.lineage.source_archive_id, Some(inner_summary.record_id));
        assert_eq!(a.lineage.root_archive_id, Some(outer_summary.record_id));
        assert_eq!(a.lineage.archive_path, vec!["outer.zip", "inner.zip"]);
        assert_eq!(out.visited_additions.len(), 4);
    }

    #[tokio::test]
    async fn archive_already_on_branch_yields_marker() {
        let f = Fixture::new();
        let zip = make_zip(&[("a.txt", b"loop")]);
        let first = f.job("loop.zip", &zip);
        let visited = VisitedArchives::default().with(ArchiveIdentity::of(&first.path).keys());

        // same bytes unpacked to a different path
        let copy = f.job("copy_of_loop.zip", &zip);
        let out = f.decomposer.decompose(copy, visited, 1).await;

        assert_eq!(out.records.len(), 1);
        let marker = &out.records[0];
        assert_eq!(marker.kind, RecordKind::DuplicateArchive);
        assert_eq!(marker.extraction_error.as_ref().unwrap().kind, ErrorKind::DuplicateArchive);
        assert!(marker.content_text.as_deref().unwrap().contains("copy_of_loop.zip"));
    }

    #[tokio::test]
    async fn identical_siblings_are_both_expanded() {
        let f = Fixture::new();
        let inner = make_zip(&[("x.txt", b"same")]);
        let outer = make_zip(&[("one.zip", &inner), ("two.zip", &inner)]);

        let out = f.run("outer.zip", &outer).await;
        assert!(out.records.iter().all(|r| r.kind != RecordKind::DuplicateArchive));
        assert_eq!(out.records.iter().filter(|r| r.display_name == "x.txt").count(), 2);
    }

    #[tokio::test]
    async fn nesting_beyond_limit_fails_that_archive() {
        let f = Fixture::with_settings(ExtractionSettings {
            max_archive_depth: 0,
            ..Default::default()
        });
        let inner = make_zip(&[("deep.txt", b"too deep")]);
        let outer = make_zip(&[("inner.zip", &inner)]);

        let out = f.run("outer.zip", &outer).await;
        let inner_summary = by_name(&out.records, "inner.zip");
        assert_eq!(inner_summary.extraction_status, ExtractionStatus::Failed);
        assert!(out.records.iter().all(|r| r.display_name != "deep.txt"));
    }

    #[tokio::test]
    async fn corrupt_archive_is_single_failed_summary() {
        let f = Fixture::new();
        let out = f.run("broken.zip", b"PK\x03\x04 not really a zip").await;
        assert_eq!(out.records.len(), 1);
        let summary = &out.records[0];
        assert_eq!(summary.extraction_status, ExtractionStatus::Failed);
        assert_eq!(summary.extraction_error.as_ref().unwrap().kind, ErrorKind::Archive);
        assert!(summary.content_text.as_deref().unwrap().contains("broken.zip"));
        assert_eq!(f.scratch_dirs_left(), 0);
    }

    #[tokio::test]
    async fn empty_archive_is_empty_summary() {
        let f = Fixture::new();
        let out = f.run("empty.zip", &make_zip(&[])).await;
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].extraction_status, ExtractionStatus::EmptyContent);
    }

    #[tokio::test]
    async fn hidden_and_escaping_entries_are_skipped() {
        let f = Fixture::new();
        let zip = make_zip(&[
            ("__MACOSX/._notes.txt", b"resource fork"),
            (".DS_Store", b"junk"),
            ("../escape.txt", b"outside"),
            ("notes.txt", b"kept"),
        ]);
        let out = f.run("mac.zip", &zip).await;

        assert_eq!(out.records.len(), 2);
        let text = out.records[0].content_text.as_deref().unwrap();
        assert!(text.contains("Entries: 1"));
        assert!(text.contains("1 unsafe paths"));
        assert!(!f.resources.root().join("escape.txt").exists());
    }

    #[test]
    fn unpack_keeps_archive_order_and_resolves_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        std::fs::write(
            &archive,
            make_zip(&[("z.txt", b"z"), ("scans/noext", &solid_png(2, 2)), ("a.json", b"{}")]),
        )
        .unwrap();
        let dest = dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();

        let report = unpack(&archive, &dest, u64::MAX).unwrap();
        let names: Vec<_> = report.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["z.txt", "scans/noext", "a.json"]);
        assert_eq!(report.entries[1].extension, "png");
        assert_eq!(report.entries[1].display_name, "noext");
        assert_eq!(report.entries[1].class, EntryClass::Leaf);
    }

    #[test]
    fn unpack_rejects_archives_over_byte_limit() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("big.zip");
        std::fs::write(&archive, make_zip(&[("a.txt", &[b'a'; 10]), ("b.txt", &[b'b'; 10])])).unwrap();
        let dest = dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();

        assert!(unpack(&archive, &dest, 20).is_ok());
        let err = unpack(&archive, &dest, 15).unwrap_err();
        assert!(matches!(err, ArchiveError::TooLarge { max: 15 }));
    }

    #[test]
    fn entry_classes() {
        assert_eq!(EntryClass::of("zip"), EntryClass::Nested);
        assert_eq!(EntryClass::of("pdf"), EntryClass::Leaf);
        assert_eq!(EntryClass::of("xlsx"), EntryClass::Unsupported);
    }
}
