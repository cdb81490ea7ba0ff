use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::PdfMode;

/// Application-level constants
pub const APP_NAME: &str = "medintake";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_EXTRACTION_WORKERS: usize = 10;
pub const DEFAULT_CLASSIFICATION_WORKERS: usize = 20;
pub const DEFAULT_PDF_PAGE_WORKERS: usize = 10;
pub const DEFAULT_NESTED_ARCHIVE_WORKERS: usize = 2;
pub const DEFAULT_MAX_ARCHIVE_DEPTH: usize = 8;
/// Uncompressed bytes a single archive may expand to.
pub const DEFAULT_MAX_UNPACKED_BYTES: u64 = 2 * 1024 * 1024 * 1024;
pub const DEFAULT_CLASSIFICATION_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_VISION_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_CLASSIFIER_MODEL: &str = "gemini-2.5-pro";

/// Characters of content sent to the classifier.
pub const CLASSIFICATION_SAMPLE_CHARS: usize = 2000;
pub const MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;

/// Prefixes of the collaborator endpoint variables.
pub const CLASSIFIER_ENV_PREFIX: &str = "FILE_TYPE_LLM";
pub const VISION_ENV_PREFIX: &str = "MULTIMODAL";

/// `RUST_LOG`-style filter used when the variable is unset.
pub fn default_log_filter() -> &'static str {
    "medintake=info,warn"
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be at least 1")]
    ZeroPool { name: &'static str },

    #[error("{name} must be greater than zero")]
    ZeroTimeout { name: &'static str },

    #[error("Endpoint {base_url} lists no models")]
    NoModels { base_url: String },
}

/// OpenAI-compatible endpoint. Several keys and models may be configured;
/// keys are shuffled per call and models are tried in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmEndpoint {
    pub base_url: String,
    pub api_keys: Vec<String>,
    pub models: Vec<String>,
}

impl LlmEndpoint {
    /// Read `{prefix}_BASE_URL`, `{prefix}_API_KEY` and `model_var`
    /// (comma-separated lists). `None` when the URL or keys are missing.
    pub fn from_lookup(
        prefix: &str,
        model_var: &str,
        default_model: Option<&str>,
        lookup: &impl Fn(&str) -> Option<String>,
    ) -> Option<Self> {
        let base_url = lookup(&format!("{prefix}_BASE_URL"))
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())?;
        let api_keys = split_list(lookup(&format!("{prefix}_API_KEY")));
        if api_keys.is_empty() {
            tracing::warn!(prefix, "Endpoint has a base URL but no API key, ignoring");
            return None;
        }
        let mut models = split_list(lookup(&format!("{prefix}_{model_var}")));
        if models.is_empty() {
            models.extend(default_model.map(str::to_string));
        }
        Some(Self {
            base_url,
            api_keys,
            models,
        })
    }
}

fn split_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Run-independent settings for the intake pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    pub pdf_mode: PdfMode,
    pub extraction_workers: usize,
    /// Ceiling for concurrent classifier calls.
    pub classification_workers: usize,
    pub pdf_page_workers: usize,
    pub nested_archive_workers: usize,
    pub max_archive_depth: usize,
    pub max_unpacked_bytes: u64,
    pub classification_timeout_secs: u64,
    pub vision_timeout_secs: u64,
    /// Parent of every scratch and persistent directory.
    pub temp_root: PathBuf,
    pub classifier: Option<LlmEndpoint>,
    pub vision: Option<LlmEndpoint>,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            pdf_mode: PdfMode::Default,
            extraction_workers: DEFAULT_EXTRACTION_WORKERS,
            classification_workers: DEFAULT_CLASSIFICATION_WORKERS,
            pdf_page_workers: DEFAULT_PDF_PAGE_WORKERS,
            nested_archive_workers: DEFAULT_NESTED_ARCHIVE_WORKERS,
            max_archive_depth: DEFAULT_MAX_ARCHIVE_DEPTH,
            max_unpacked_bytes: DEFAULT_MAX_UNPACKED_BYTES,
            classification_timeout_secs: DEFAULT_CLASSIFICATION_TIMEOUT_SECS,
            vision_timeout_secs: DEFAULT_VISION_TIMEOUT_SECS,
            temp_root: std::env::temp_dir(),
            classifier: None,
            vision: None,
        }
    }
}

impl IntakeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Invalid values keep the
    /// default and log a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            pdf_mode: parse_or(&lookup, "PDF_EXTRACTION_MODE", defaults.pdf_mode),
            extraction_workers: parse_or(&lookup, "MAX_CONCURRENT_FILE_WORKERS", defaults.extraction_workers),
            classification_workers: parse_or(
                &lookup,
                "MULTIMODAL_IMAGE_CONCURRENT_WORKERS",
                defaults.classification_workers,
            ),
            pdf_page_workers: parse_or(&lookup, "PDF_IMAGE_CONCURRENT_WORKERS", defaults.pdf_page_workers),
            nested_archive_workers: parse_or(&lookup, "NESTED_ARCHIVE_WORKERS", defaults.nested_archive_workers),
            max_archive_depth: parse_or(&lookup, "MAX_ARCHIVE_DEPTH", defaults.max_archive_depth),
            max_unpacked_bytes: parse_or(&lookup, "MAX_ARCHIVE_UNPACKED_BYTES", defaults.max_unpacked_bytes),
            classification_timeout_secs: parse_or(
                &lookup,
                "CLASSIFICATION_TIMEOUT_SECS",
                defaults.classification_timeout_secs,
            ),
            vision_timeout_secs: parse_or(&lookup, "VISION_TIMEOUT_SECS", defaults.vision_timeout_secs),
            temp_root: lookup("INTAKE_TEMP_ROOT")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_root),
            classifier: LlmEndpoint::from_lookup(
                CLASSIFIER_ENV_PREFIX,
                "MODEL",
                Some(DEFAULT_CLASSIFIER_MODEL),
                &lookup,
            ),
            vision: LlmEndpoint::from_lookup(VISION_ENV_PREFIX, "MODEL_NAME", None, &lookup),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("extraction_workers", self.extraction_workers),
            ("classification_workers", self.classification_workers),
            ("pdf_page_workers", self.pdf_page_workers),
            ("nested_archive_workers", self.nested_archive_workers),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroPool { name });
            }
        }
        for (name, value) in [
            ("classification_timeout_secs", self.classification_timeout_secs),
            ("vision_timeout_secs", self.vision_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroTimeout { name });
            }
        }
        for endpoint in self.classifier.iter().chain(self.vision.iter()) {
            if endpoint.models.is_empty() {
                return Err(ConfigError::NoModels {
                    base_url: endpoint.base_url.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn classification_timeout(&self) -> Duration {
        Duration::from_secs(self.classification_timeout_secs)
    }

    pub fn vision_timeout(&self) -> Duration {
        Duration::from_secs(self.vision_timeout_secs)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, default = ?default, "Invalid setting, using default");
                default
            }
        },
        None => default,
    }
}
