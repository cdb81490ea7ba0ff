//! Cleanup and parsing of raw classifier output.

use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;

use super::ClassificationError;
use crate::models::Category;

const BOX_OPEN: &str = "<|begin_of_box|>";
const BOX_CLOSE: &str = "<|end_of_box|>";

/// Strip model wrapper tokens and markdown fences.
pub fn sanitize_response(raw: &str) -> String {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix(BOX_OPEN) {
        text = rest.trim();
    }
    if let Some(rest) = text.strip_suffix(BOX_CLOSE) {
        text = rest.trim();
    }

    if text.starts_with("```") {
        let mut lines: Vec<&str> = text.lines().collect();
        if !lines.is_empty() {
            lines.remove(0);
        }
        if lines.last().is_some_and(|l| l.trim() == "```") {
            lines.pop();
        }
        return lines.join("\n").trim().to_string();
    }
    text.to_string()
}

#[derive(Debug, Deserialize)]
struct RawClassification {
    #[serde(default, alias = "file_type")]
    category: Option<Value>,
    #[serde(default)]
    exam_date: Option<Value>,
    #[serde(default)]
    note: Option<Value>,
}

/// Parsed classifier answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedClassification {
    pub category: Category,
    pub exam_date: Option<NaiveDate>,
    pub note: Option<String>,
}

/// Parse a raw response. Errors are the retryable shape problems; an
/// unknown category is not an error and maps to the catch-all.
pub fn parse_response(raw: &str) -> Result<ParsedClassification, ClassificationError> {
    if raw.trim().is_empty() {
        return Err(ClassificationError::EmptyResponse);
    }
    let text = sanitize_response(raw);
    if text.is_empty() {
        return Err(ClassificationError::EmptyResponse);
    }
    if !text.ends_with('}') {
        return Err(ClassificationError::TruncatedJson);
    }

    let parsed: RawClassification =
        serde_json::from_str(&text).map_err(|e| ClassificationError::MalformedJson(e.to_string()))?;

    let label = parsed.category.as_ref().and_then(value_str).unwrap_or_default();
    let mut note = parsed.note.as_ref().and_then(value_str).filter(|n| !n.is_empty());
    let category = match Category::parse_label(&label) {
        Some(category) => category,
        None => {
            tracing::warn!(label = %label, "Unrecognized category, using catch-all");
            note.get_or_insert_with(|| format!("unrecognized category '{label}'"));
            Category::Other
        }
    };

    let exam_date = if category.is_catch_all() {
        None
    } else {
        parsed.exam_date.as_ref().and_then(value_str).and_then(|s| parse_exam_date(&s))
    };

    Ok(ParsedClassification {
        category,
        exam_date,
        note,
    })
}

/// `YYYY-MM-DD`; `"null"`, blanks and anything else are `None`.
pub fn parse_exam_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
        return None;
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").ok()
}

fn value_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
