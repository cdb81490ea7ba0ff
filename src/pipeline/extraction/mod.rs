pub mod dispatcher;
pub mod garbled;
pub mod image;
pub mod office;
pub mod pdf;
pub mod pdfium;
pub mod sanitize;
pub mod text;
pub mod types;

pub use dispatcher::*;
pub use garbled::*;
pub use sanitize::*;
pub use types::*;

use thiserror::Error;

use crate::models::{ErrorKind, RecordError};
use crate::pipeline::import::InputError;
use crate::pipeline::resources::ResourceError;
use crate::pipeline::stage::ConcurrencyError;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDF parsing failed: {0}")]
    PdfParsing(String),

    #[error("PDF is encrypted (password-protected)")]
    PdfEncrypted,

    #[error("PDF page {page} rendering failed: {reason}")]
    PdfRendering { page: usize, reason: String },

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("{format} parsing failed: {reason}")]
    DocumentParsing { format: &'static str, reason: String },

    #[error("Text encoding error: {0}")]
    EncodingError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Vision model is not configured")]
    VisionUnavailable,

    #[error("Vision call timed out after {secs}s")]
    VisionTimeout { secs: u64 },

    #[error("Vision call failed: {0}")]
    Vision(String),

    #[error("Parser panicked: {0}")]
    ParserPanicked(String),

    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Temp resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),
}

impl From<ExtractionError> for RecordError {
    fn from(e: ExtractionError) -> Self {
        let kind = match &e {
            ExtractionError::Input(_) => ErrorKind::Input,
            ExtractionError::Resource(_) => ErrorKind::Resource,
            _ => ErrorKind::Extraction,
        };
        RecordError::new(kind, e.to_string())
    }
}

/// Run a blocking parser off the async workers. A panic inside the parser
/// becomes `ExtractionError::ParserPanicked`.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, ExtractionError>
where
    F: FnOnce() -> Result<T, ExtractionError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(ExtractionError::ParserPanicked(e.to_string())),
    }
}
