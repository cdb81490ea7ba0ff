//! Final ordering of a run's records and the aggregate counters reported
//! alongside them.

use serde::Serialize;

use crate::models::{ExtractedRecord, ExtractionStatus, RecordKind};

/// Output group a record is placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// A top-level archive's own record.
    ArchiveParent,
    /// Anything found inside an archive, at any depth.
    InsideArchive,
    Standalone,
}

impl Origin {
    pub fn of(record: &ExtractedRecord) -> Self {
        if record.lineage.is_inside_archive() {
            Self::InsideArchive
        } else if matches!(
            record.kind,
            RecordKind::ArchiveSummary | RecordKind::DuplicateArchive
        ) {
            Self::ArchiveParent
        } else {
            Self::Standalone
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OriginCounts {
    pub archive_parent: usize,
    pub inside_archive: usize,
    pub standalone: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub success: usize,
    pub empty_content: usize,
    pub failed: usize,
}

/// Timing of one stage invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageTiming {
    pub stage: &'static str,
    pub items: usize,
    pub elapsed_ms: u64,
    pub peak_in_flight: usize,
}

/// Counters for one run. Observability only; nothing downstream depends on them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub inputs: usize,
    pub duplicates_removed: usize,
    pub skipped_hidden: usize,
    pub records: usize,
    pub by_origin: OriginCounts,
    pub by_status: StatusCounts,
    pub classified: usize,
    pub catch_all: usize,
    pub persistent_artifacts: usize,
    pub stages: Vec<StageTiming>,
}

impl RunStats {
    pub fn stage(&self, name: &str) -> Option<&StageTiming> {
        self.stages.iter().find(|s| s.stage == name)
    }
}

pub struct ResultAssembler;

impl ResultAssembler {
    /// Order records as archive parents, then archive contents, then
    /// standalone records. Within a group, records follow their ordinal,
    /// so the result does not depend on worker completion order.
    pub fn assemble(mut records: Vec<ExtractedRecord>) -> Vec<ExtractedRecord> {
        records.sort_by(|a, b| {
            Origin::of(a)
                .cmp(&Origin::of(b))
                .then_with(|| a.ordinal.cmp(&b.ordinal))
        });
        records
    }

    /// Fill the record-derived counters of `stats`.
    pub fn tally(records: &[ExtractedRecord], stats: &mut RunStats) {
        stats.records = records.len();
        stats.by_origin = OriginCounts::default();
        stats.by_status = StatusCounts::default();
        stats.classified = 0;
        stats.catch_all = 0;

        for record in records {
            match Origin::of(record) {
                Origin::ArchiveParent => stats.by_origin.archive_parent += 1,
                Origin::InsideArchive => stats.by_origin.inside_archive += 1,
                Origin::Standalone => stats.by_origin.standalone += 1,
            }
            match record.extraction_status {
                ExtractionStatus::Success => stats.by_status.success += 1,
                ExtractionStatus::EmptyContent => stats.by_status.empty_content += 1,
                ExtractionStatus::Failed => stats.by_status.failed += 1,
            }
            match record.category {
                Some(category) if !category.is_catch_all() => stats.classified += 1,
                Some(_) => stats.catch_all += 1,
                None => {}
            }
        }
    }
}
