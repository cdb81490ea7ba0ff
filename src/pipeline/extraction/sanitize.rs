/// Normalize extracted text before it is stored on a record.
/// Strips control characters (tab kept), trims lines, drops blank lines.
pub fn sanitize_extracted_text(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
        .filter(|c| *c != '\u{FEFF}')
        .collect::<String>()
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_null_bytes() {
        let raw = "Patient: Marie\x00Dubois";
        let clean = sanitize_extracted_text(raw);
        assert!(!clean.contains('\x00'));
        assert_eq!(clean, "Patient: MarieDubois");
    }

    #[test]
    fn strips_control_characters() {
        let raw = "Dose: 500mg\x01\x02\x03\nDate: 2024-01-15";
        let clean = sanitize_extracted_text(raw);
        assert_eq!(clean, "Dose: 500mg\nDate: 2024-01-15");
    }

    #[test]
    fn keeps_table_separators_and_cjk() {
        let raw = "项目 | 结果 | 参考值\n白细胞 | 6.2 | 3.5-9.5";
        assert_eq!(sanitize_extracted_text(raw), raw);
    }

    #[test]
    fn collapses_blank_lines() {
        let raw = "Line one\n\n\n\nLine two\r\n\r\nLine three";
        let clean = sanitize_extracted_text(raw);
        assert_eq!(clean, "Line one\nLine two\nLine three");
    }

    #[test]
    fn strips_byte_order_mark() {
        assert_eq!(sanitize_extracted_text("\u{FEFF}Report"), "Report");
    }

    #[test]
    fn only_control_chars_returns_empty() {
        assert_eq!(sanitize_extracted_text("\x00\x01\x02"), "");
    }
}
