//! Batch intake orchestrator.
//!
//! Drives one batch through the stages:
//! dedup → extract (archives and PDFs expanded) → classify → assemble.
//!
//! Collaborators (classifier, vision, page renderer) are injected, so the
//! orchestrator is testable with the in-crate mocks. Per-record failures
//! never fail the run; only configuration errors and cancellation do.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, IntakeConfig};
use crate::models::{
    ErrorKind, ExtractedRecord, FileInput, FileSource, Lineage, Ordinal, PdfMode, RecordError,
    RecordKind,
};
use crate::pipeline::archive::read_header;
use crate::pipeline::assembler::{ResultAssembler, RunStats, StageTiming};
use crate::pipeline::classify::{ClassificationCoordinator, ClassifierBackend};
use crate::pipeline::extraction::pdfium::PdfiumRenderer;
use crate::pipeline::extraction::{
    ExtractionContext, ExtractionDispatcher, ExtractionJob, ExtractionSettings, PdfPageRenderer,
    VisionDescriber,
};
use crate::pipeline::import::{
    resolve_extension, sanitize_filename, DuplicateEntry, DuplicateFilter, InputError, UniqueInput,
};
use crate::pipeline::llm::{LlmError, OpenAiCompatClient};
use crate::pipeline::resources::{PersistentArtifacts, ResourceError, TempResourceManager};
use crate::pipeline::stage::{ConcurrencyError, ConcurrentStageRunner};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that fail a whole run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    InvalidConcurrency(#[from] ConcurrencyError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Collaborator setup failed: {0}")]
    Collaborator(#[from] LlmError),

    #[error("Temp resource setup failed: {0}")]
    Resource(#[from] ResourceError),

    #[error("Stage '{stage}' could not complete: {reason}")]
    Stage { stage: &'static str, reason: String },

    #[error("Pipeline run was cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Options and output
// ---------------------------------------------------------------------------

/// Per-run overrides of the configured pool sizes and PDF mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineOptions {
    pub pdf_mode: PdfMode,
    pub extraction_concurrency: usize,
    pub classification_concurrency: usize,
}

impl PipelineOptions {
    pub fn from_config(config: &IntakeConfig) -> Self {
        Self {
            pdf_mode: config.pdf_mode,
            extraction_concurrency: config.extraction_workers,
            classification_concurrency: config.classification_workers,
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&IntakeConfig::default())
    }
}

/// Everything a run hands back to the caller.
#[derive(Debug)]
pub struct IntakeOutput {
    /// Assembled records: archive parents, archive contents, standalone.
    pub records: Vec<ExtractedRecord>,
    pub stats: RunStats,
    pub duplicates: Vec<DuplicateEntry>,
    /// Temp artifacts still referenced by `records`. The caller releases them.
    pub artifacts: PersistentArtifacts,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Pipeline {
    config: IntakeConfig,
    classifier: Option<Arc<dyn ClassifierBackend>>,
    vision: Option<Arc<dyn VisionDescriber>>,
    renderer: Option<Arc<dyn PdfPageRenderer>>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Pipeline without collaborators. Classification falls back to the
    /// catch-all and images get placeholders until collaborators are added.
    pub fn new(config: IntakeConfig) -> Self {
        Self {
            config,
            classifier: None,
            vision: None,
            renderer: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Pipeline wired to the endpoints named in `config`, plus the PDFium
    /// page renderer when the library can be bound.
    pub fn connect(config: IntakeConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let mut pipeline = Self::new(config);

        if let Some(endpoint) = pipeline.config.classifier.clone() {
            let client = OpenAiCompatClient::new(endpoint, pipeline.config.classification_timeout())?;
            pipeline = pipeline.with_classifier(Arc::new(client));
        } else {
            tracing::warn!("No classifier endpoint configured; records will use the catch-all category");
        }

        if let Some(endpoint) = pipeline.config.vision.clone() {
            let client = OpenAiCompatClient::new(endpoint, pipeline.config.vision_timeout())?;
            pipeline = pipeline.with_vision(Arc::new(client));
        } else {
            tracing::warn!("No vision endpoint configured; images will get placeholder content");
        }

        match PdfiumRenderer::new() {
            Ok(renderer) => pipeline = pipeline.with_pdf_renderer(Arc::new(renderer)),
            Err(e) => {
                tracing::warn!(error = %e, "PDFium unavailable; with-images PDF mode falls back to text")
            }
        }
        Ok(pipeline)
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ClassifierBackend>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_vision(mut self, vision: Arc<dyn VisionDescriber>) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn with_pdf_renderer(mut self, renderer: Arc<dyn PdfPageRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Token checked between stages.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &IntakeConfig {
        &self.config
    }

    /// Run one batch.
    ///
    /// Every surviving input yields at least one record carrying its own
    /// status. Fails only on invalid configuration or cancellation.
    pub async fn run(
        &self,
        inputs: Vec<FileInput>,
        options: PipelineOptions,
    ) -> Result<IntakeOutput, PipelineError> {
        self.config.validate()?;
        let extraction_runner =
            ConcurrentStageRunner::new("extraction", options.extraction_concurrency)?;
        let coordinator = ClassificationCoordinator::new(
            self.classifier.clone(),
            options.classification_concurrency,
        )?
        .with_attempt_timeout(self.config.classification_timeout());

        let run_start = Instant::now();
        let mut stats = RunStats {
            inputs: inputs.len(),
            ..Default::default()
        };
        tracing::info!(
            inputs = inputs.len(),
            pdf_mode = %options.pdf_mode,
            extraction_workers = options.extraction_concurrency,
            classification_workers = options.classification_concurrency,
            "Starting intake run"
        );
        self.checkpoint(None)?;

        // Stage 1: dedup (serial)
        let stage_start = Instant::now();
        let outcome = tokio::task::spawn_blocking(move || DuplicateFilter::new().filter(inputs))
            .await
            .map_err(|e| PipelineError::Stage {
                stage: "dedup",
                reason: e.to_string(),
            })?;
        stats.duplicates_removed = outcome.duplicates.len();
        stats.stages.push(StageTiming {
            stage: "dedup",
            items: stats.inputs,
            elapsed_ms: elapsed_ms(stage_start),
            peak_in_flight: 1,
        });
        self.checkpoint(None)?;

        // Stage 2: extraction
        let resources = Arc::new(TempResourceManager::new(self.config.temp_root.clone()));
        let stage_start = Instant::now();
        let unique_count = outcome.unique.len();
        let (mut records, skipped) = self
            .extract_all(outcome.unique, &options, &resources, &extraction_runner)
            .await?;
        stats.skipped_hidden = skipped;
        stats.stages.push(StageTiming {
            stage: "extraction",
            items: unique_count,
            elapsed_ms: elapsed_ms(stage_start),
            peak_in_flight: extraction_runner.peak_in_flight(),
        });
        self.checkpoint(Some(&resources))?;

        // Stage 3: classification
        let classification = coordinator.classify_records(&mut records).await;
        stats.stages.push(StageTiming {
            stage: "classification",
            items: classification.requested,
            elapsed_ms: classification.elapsed_ms,
            peak_in_flight: classification.peak_in_flight,
        });
        self.checkpoint(Some(&resources))?;

        // Stage 4: assembly
        let records = ResultAssembler::assemble(records);
        ResultAssembler::tally(&records, &mut stats);
        stats.persistent_artifacts = resources.persistent_count();

        tracing::info!(
            inputs = stats.inputs,
            duplicates = stats.duplicates_removed,
            records = stats.records,
            success = stats.by_status.success,
            empty = stats.by_status.empty_content,
            failed = stats.by_status.failed,
            classified = stats.classified,
            catch_all = stats.catch_all,
            persistent_artifacts = stats.persistent_artifacts,
            elapsed_ms = %run_start.elapsed().as_millis(),
            "Intake run complete"
        );

        Ok(IntakeOutput {
            records,
            stats,
            duplicates: outcome.duplicates,
            artifacts: PersistentArtifacts::new(resources),
        })
    }

    /// Extract every unique input on the bounded extraction pool.
    /// Returns the records in completion order and the number of hidden inputs skipped.
    async fn extract_all(
        &self,
        unique: Vec<UniqueInput>,
        options: &PipelineOptions,
        resources: &Arc<TempResourceManager>,
        runner: &ConcurrentStageRunner,
    ) -> Result<(Vec<ExtractedRecord>, usize), PipelineError> {
        let staging = resources.scratch("inputs")?;
        let staging_dir = staging.path().to_path_buf();

        let settings = ExtractionSettings {
            pdf_mode: options.pdf_mode,
            archive_entry_concurrency: options.extraction_concurrency,
            nested_archive_concurrency: self.config.nested_archive_workers,
            page_vision_concurrency: self.config.pdf_page_workers,
            max_archive_depth: self.config.max_archive_depth,
            max_unpacked_bytes: self.config.max_unpacked_bytes,
            vision_timeout: self.config.vision_timeout(),
            ..Default::default()
        };
        let mut ctx = ExtractionContext::new(resources.clone(), settings);
        if let Some(vision) = &self.vision {
            ctx = ctx.with_vision(vision.clone());
        }
        if let Some(renderer) = &self.renderer {
            ctx = ctx.with_pdf_renderer(renderer.clone());
        }
        let dispatcher = Arc::new(ExtractionDispatcher::new(Arc::new(ctx)));

        // Kept for building a record when a worker dies.
        let fallbacks: Vec<(usize, String, Option<String>)> = unique
            .iter()
            .map(|u| {
                (
                    u.original_index,
                    u.input.name.clone(),
                    u.input.declared_type.clone(),
                )
            })
            .collect();

        let outputs = runner
            .run(unique, move |_, item: UniqueInput| {
                let dispatcher = dispatcher.clone();
                let staging_dir = staging_dir.clone();
                async move { extract_input(&dispatcher, item, &staging_dir).await }
            })
            .await;
        drop(staging);

        let mut records = Vec::new();
        let mut skipped = 0;
        for output in outputs {
            match output.result {
                Ok(Some(produced)) => records.extend(produced),
                Ok(None) => skipped += 1,
                Err(e) => {
                    let Some((index, name, declared_type)) = fallbacks.get(output.index).cloned() else {
                        continue;
                    };
                    let mut record = ExtractedRecord::new(
                        RecordKind::Document,
                        name.as_str(),
                        crate::pipeline::import::extension_of(&name),
                        Ordinal::root(index),
                        Lineage::default(),
                    );
                    record.declared_type = declared_type;
                    record.mark_failed(RecordError::new(ErrorKind::Extraction, e.to_string()));
                    records.push(record);
                }
            }
        }
        Ok((records, skipped))
    }

    /// Stage boundary. Releases persistent artifacts when the run is cancelled.
    fn checkpoint(&self, resources: Option<&Arc<TempResourceManager>>) -> Result<(), PipelineError> {
        if !self.cancel.is_cancelled() {
            return Ok(());
        }
        if let Some(resources) = resources {
            let failures = resources.release_all();
            tracing::warn!(failures, "Run cancelled; persistent artifacts released");
        } else {
            tracing::warn!("Run cancelled");
        }
        Err(PipelineError::Cancelled)
    }
}

/// Extract one top-level input. `None` when the input is a hidden/system file.
async fn extract_input(
    dispatcher: &Arc<ExtractionDispatcher>,
    item: UniqueInput,
    staging_dir: &std::path::Path,
) -> Option<Vec<ExtractedRecord>> {
    let ordinal = Ordinal::root(item.original_index);
    let content_hash = item.content_hash().map(str::to_string);
    let key = item.key;
    let input = item.input;

    let path = match materialize(&input, item.original_index, staging_dir).await {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!(file = %input.name, error = %e, "Input is not readable");
            let mut record = ExtractedRecord::new(
                RecordKind::Document,
                input.name.as_str(),
                crate::pipeline::import::extension_of(&input.name),
                ordinal,
                Lineage::default(),
            );
            record.declared_type = input.declared_type.clone();
            record.mark_failed(e.into());
            record.content_hash = content_hash;
            record.dedup_key = Some(key);
            return Some(vec![record]);
        }
    };

    let header_path = path.clone();
    let header = tokio::task::spawn_blocking(move || read_header(&header_path))
        .await
        .unwrap_or_default();
    let job = ExtractionJob {
        path,
        display_name: input.name.clone(),
        extension: resolve_extension(&input.name, &header),
        declared_type: input.declared_type.clone(),
        ordinal: ordinal.clone(),
        lineage: Lineage::default(),
    };

    let mut records = dispatcher.dispatch(job).await?;
    for record in records.iter_mut().filter(|r| r.ordinal == ordinal) {
        record.content_hash = content_hash.clone();
        record.dedup_key = Some(key.clone());
    }
    Some(records)
}

/// Local path for the input's bytes. Inline bytes are written to `staging_dir`.
async fn materialize(
    input: &FileInput,
    index: usize,
    staging_dir: &std::path::Path,
) -> Result<std::path::PathBuf, InputError> {
    match &input.source {
        FileSource::Path(path) => {
            let metadata = tokio::fs::metadata(path)
                .await
                .map_err(|source| InputError::Unreadable {
                    path: path.clone(),
                    source,
                })?;
            if !metadata.is_file() {
                return Err(InputError::NotAFile(path.clone()));
            }
            Ok(path.clone())
        }
        FileSource::Inline(bytes) => {
            let target = staging_dir.join(format!("{index}_{}", sanitize_filename(&input.name)));
            tokio::fs::write(&target, bytes)
                .await
                .map_err(|source| InputError::Staging {
                    name: input.name.clone(),
                    source,
                })?;
            Ok(target)
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Convenience for callers holding only a config: connect and run once.
pub async fn run_batch(
    config: IntakeConfig,
    inputs: Vec<FileInput>,
) -> Result<IntakeOutput, PipelineError> {
    let options = PipelineOptions::from_config(&config);
    Pipeline::connect(config)?.run(inputs, options).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
