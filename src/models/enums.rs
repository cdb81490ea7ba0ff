use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {field} value: {value}")]
pub struct InvalidEnum {
    pub field: String,
    pub value: String,
}

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = InvalidEnum;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(ExtractionStatus {
    Success => "success",
    EmptyContent => "empty_content",
    Failed => "failed",
});

str_enum!(RecordKind {
    Document => "document",
    ArchiveSummary => "archive_summary",
    DuplicateArchive => "duplicate_archive",
    PageImage => "page_image",
});

str_enum!(ErrorKind {
    Input => "input",
    Archive => "archive",
    DuplicateArchive => "duplicate_archive",
    Extraction => "extraction",
    Classification => "classification",
    Resource => "resource",
});

str_enum!(PdfMode {
    Default => "default",
    WithImages => "with_images",
});

str_enum!(Category {
    LabReport => "lab_report",
    ImagingReport => "imaging_report",
    PathologyReport => "pathology_report",
    DiagnosisReport => "diagnosis_report",
    Prescription => "prescription",
    SurgeryRecord => "surgery_record",
    NursingRecord => "nursing_record",
    PhysicalExam => "physical_exam",
    Other => "other",
});

impl Default for PdfMode {
    fn default() -> Self {
        Self::Default
    }
}

impl Category {
    /// The eight domain categories, catch-all excluded.
    pub const DOMAIN: [Category; 8] = [
        Category::LabReport,
        Category::ImagingReport,
        Category::PathologyReport,
        Category::DiagnosisReport,
        Category::Prescription,
        Category::SurgeryRecord,
        Category::NursingRecord,
        Category::PhysicalExam,
    ];

    /// Label used by Chinese-language classifier prompts and responses.
    pub fn label_zh(&self) -> &'static str {
        match self {
            Self::LabReport => "检验单",
            Self::ImagingReport => "影像报告",
            Self::PathologyReport => "病理报告",
            Self::DiagnosisReport => "诊断报告",
            Self::Prescription => "处方单",
            Self::SurgeryRecord => "手术记录",
            Self::NursingRecord => "护理记录",
            Self::PhysicalExam => "体检报告",
            Self::Other => "其他",
        }
    }

    /// Parse a classifier label: snake_case name, Chinese label, or spaced English.
    pub fn parse_label(label: &str) -> Option<Self> {
        let trimmed = label.trim();
        if let Ok(category) = trimmed.parse::<Self>() {
            return Some(category);
        }
        let normalized = trimmed.to_lowercase().replace([' ', '-'], "_");
        if let Ok(category) = normalized.parse::<Self>() {
            return Some(category);
        }
        Self::DOMAIN
            .iter()
            .chain(std::iter::once(&Self::Other))
            .find(|c| c.label_zh() == trimmed)
            .copied()
    }

    pub fn is_catch_all(&self) -> bool {
        matches!(self, Self::Other)
    }
}
