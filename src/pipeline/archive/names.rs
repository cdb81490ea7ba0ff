//! Archive entry names: legacy encodings and path safety.

use std::path::{Component, Path, PathBuf};

use encoding_rs::{Encoding, BIG5, EUC_KR, GB18030, GBK, SHIFT_JIS, WINDOWS_1252};

/// Fallback encodings tried after UTF-8 and GBK, in order.
const DETECTION_ORDER: [&Encoding; 5] = [GB18030, BIG5, SHIFT_JIS, EUC_KR, WINDOWS_1252];

/// Decode a raw entry name. Returns the name and the encoding that produced it,
/// or `None` when no encoding yields a clean, lossless result.
pub fn decode_entry_name(raw: &[u8]) -> Option<(String, &'static str)> {
    if let Ok(name) = std::str::from_utf8(raw) {
        if is_clean(name) {
            return Some((name.to_string(), "UTF-8"));
        }
    }

    std::iter::once(GBK)
        .chain(DETECTION_ORDER)
        .find_map(|encoding| {
            encoding
                .decode_without_bom_handling_and_without_replacement(raw)
                .filter(|name| is_clean(name))
                .map(|name| (name.into_owned(), encoding.name()))
        })
}

fn is_clean(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(char::is_control)
}

/// Relative path for an entry, or `None` if it is absolute or escapes the
/// extraction root.
pub fn safe_relative_path(name: &str) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    let path = Path::new(&normalized);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                // Windows drive prefixes ("C:") survive as normal components on unix
                if part.to_string_lossy().contains(':') {
                    return None;
                }
                out.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

/// Hidden or OS metadata anywhere along the path.
pub fn is_hidden_entry(relative: &Path) -> bool {
    relative
        .components()
        .any(|c| crate::pipeline::import::is_hidden_name(&c.as_os_str().to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_names_pass_through() {
        let (name, enc) = decode_entry_name("检查报告/血常规.pdf".as_bytes()).unwrap();
        assert_eq!(name, "检查报告/血常规.pdf");
        assert_eq!(enc, "UTF-8");
    }

    #[test]
    fn gbk_names_are_recovered() {
        let (bytes, _, _) = GBK.encode("血常规.pdf");
        let (name, enc) = decode_entry_name(&bytes).unwrap();
        assert_eq!(name, "血常规.pdf");
        assert_eq!(enc, "GBK");
    }

    #[test]
    fn shift_jis_falls_through_to_detection() {
        let (bytes, _, _) = SHIFT_JIS.encode("ｶﾙﾃ.txt");
        let (name, _) = decode_entry_name(&bytes).unwrap();
        assert!(name.ends_with(".txt"));
    }

    #[test]
    fn control_characters_rejected() {
        assert!(decode_entry_name(b"bad\x01name.txt").is_none());
        assert!(decode_entry_name(b"").is_none());
    }

    #[test]
    fn traversal_and_absolute_paths_rejected() {
        assert!(safe_relative_path("../etc/passwd").is_none());
        assert!(safe_relative_path("a/../../b.txt").is_none());
        assert!(safe_relative_path("/abs/file.txt").is_none());
        assert!(safe_relative_path("..\\win\\file.txt").is_none());
        assert!(safe_relative_path("C:/file.txt").is_none());
        assert_eq!(
            safe_relative_path("./scans/a.png"),
            Some(PathBuf::from("scans/a.png"))
        );
    }

    #[test]
    fn macos_metadata_is_hidden() {
        assert!(is_hidden_entry(Path::new("__MACOSX/scans/._a.png")));
        assert!(is_hidden_entry(Path::new("scans/.DS_Store")));
        assert!(!is_hidden_entry(Path::new("scans/a.png")));
    }
}
