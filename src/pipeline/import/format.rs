use std::path::Path;

use serde::{Deserialize, Serialize};

/// Broad file categories used for placeholder text and routing decisions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FileCategory {
    Document,
    Image,
    Text,
    Spreadsheet,
    Presentation,
    Archive,
    Other,
}

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Image => "image",
            Self::Text => "text",
            Self::Spreadsheet => "spreadsheet",
            Self::Presentation => "presentation",
            Self::Archive => "archive",
            Self::Other => "other",
        }
    }

    pub fn from_extension(extension: &str) -> Self {
        match extension.to_ascii_lowercase().as_str() {
            "pdf" | "doc" | "docx" | "rtf" | "odt" => Self::Document,
            e if IMAGE_EXTENSIONS.contains(&e) => Self::Image,
            "txt" | "md" | "json" | "csv" | "xml" | "html" | "htm" => Self::Text,
            "xls" | "xlsx" | "ods" => Self::Spreadsheet,
            "ppt" | "pptx" | "odp" => Self::Presentation,
            "zip" => Self::Archive,
            _ => Self::Other,
        }
    }
}

pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "webp", "heic", "heif",
];

/// Archive entries with these extensions are sent to a format handler.
pub const ARCHIVE_LEAF_EXTENSIONS: &[&str] = &[
    "pdf", "docx", "pptx", "ppt", "txt", "md", "json", "png", "jpg", "jpeg", "webp", "heic",
    "heif", "gif", "bmp", "tiff", "tif",
];

/// Results with these extensions keep a persistent copy for later upload.
pub const PERSISTENT_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "webp", "heic", "heif", "gif", "bmp", "tiff", "tif", "pdf", "docx",
    "pptx", "ppt",
];

pub const ARCHIVE_EXTENSION: &str = "zip";

/// Lowercased extension of a file name, without the dot. Empty when absent.
pub fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Extension from the name, falling back to magic bytes when the name has none.
pub fn resolve_extension(name: &str, header: &[u8]) -> String {
    let from_name = extension_of(name);
    if !from_name.is_empty() {
        return from_name;
    }
    sniff_extension(header).map(str::to_string).unwrap_or_default()
}

/// Detect a file extension from magic bytes.
pub fn sniff_extension(header: &[u8]) -> Option<&'static str> {
    match header {
        [0x25, 0x50, 0x44, 0x46, ..] => Some("pdf"),
        [0x50, 0x4B, 0x03, 0x04, ..] | [0x50, 0x4B, 0x05, 0x06, ..] => Some("zip"),
        _ => detect_image_mime(header).map(|mime| match mime {
            "image/jpeg" => "jpg",
            "image/png" => "png",
            "image/gif" => "gif",
            "image/bmp" => "bmp",
            "image/tiff" => "tiff",
            "image/webp" => "webp",
            _ => "heic",
        }),
    }
}

/// Detect image MIME type from magic bytes (NOT file extensions).
pub fn detect_image_mime(header: &[u8]) -> Option<&'static str> {
    match header {
        [0xFF, 0xD8, 0xFF, ..] => Some("image/jpeg"),
        [0x89, 0x50, 0x4E, 0x47, ..] => Some("image/png"),
        [0x47, 0x49, 0x46, 0x38, ..] => Some("image/gif"),
        [0x42, 0x4D, ..] => Some("image/bmp"),
        [0x49, 0x49, 0x2A, 0x00, ..] | [0x4D, 0x4D, 0x00, 0x2A, ..] => Some("image/tiff"),
        [0x52, 0x49, 0x46, 0x46, _, _, _, _, 0x57, 0x45, 0x42, 0x50, ..] => Some("image/webp"),
        // HEIC/HEIF: "ftyp" at offset 4
        _ if header.len() >= 12 && &header[4..8] == b"ftyp" => Some("image/heic"),
        _ => None,
    }
}

/// Check if bytes are likely plain text (UTF-8 or GBK, mostly printable)
pub fn is_likely_text(bytes: &[u8]) -> bool {
    let sample = &bytes[..bytes.len().min(4096)];
    if sample.is_empty() || sample.contains(&0) {
        return false;
    }

    let decoded = match std::str::from_utf8(sample) {
        Ok(t) => std::borrow::Cow::Borrowed(t),
        // A multi-byte char may be cut at the sample boundary
        Err(e) if e.error_len().is_none() && e.valid_up_to() > 0 => {
            std::borrow::Cow::Borrowed(std::str::from_utf8(&sample[..e.valid_up_to()]).unwrap_or(""))
        }
        Err(_) => match encoding_rs::GBK.decode_without_bom_handling_and_without_replacement(sample) {
            Some(t) => t,
            None => return false,
        },
    };

    let total = decoded.chars().count();
    if total == 0 {
        return false;
    }
    // At least 80% printable characters (or whitespace)
    let printable = decoded
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .count();
    printable as f64 / total as f64 > 0.80
}

/// Sanitize a filename: strip path components, limit length
pub fn sanitize_filename(original: &str) -> String {
    let normalized = original.replace('\\', "/");
    let name = Path::new(&normalized)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");

    let clean: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | '\0'))
        .take(255)
        .collect();

    if clean.is_empty() {
        "document".to_string()
    } else {
        clean
    }
}

/// OS metadata files that never carry user content.
pub fn is_hidden_name(name: &str) -> bool {
    name.replace('\\', "/").split('/').any(|component| {
        component == "__MACOSX"
            || component == ".DS_Store"
            || component == "Thumbs.db"
            || component.starts_with("._")
    })
}
