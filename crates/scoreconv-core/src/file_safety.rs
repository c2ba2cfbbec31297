//! Filename hygiene for files staged from remote sources.
//!
//! Names derived from URLs and archive entries end up as paths in the work
//! directory, so they are reduced to a single safe path component first.

use std::path::Path;

/// Maximum length of a staged file name in bytes.
pub const MAX_FILENAME_BYTES: usize = 200;

/// Sanitize filename for safe storage.
///
/// Strips directory components, replaces characters that are reserved on
/// common filesystems and caps the length while keeping the extension.
pub fn sanitize_filename(filename: &str) -> String {
    // Remove path components
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);

    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' | '\0' | ' ' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let sanitized = sanitized.trim_matches(|c: char| c == '.' || c == '_' || c.is_whitespace());
    if sanitized.is_empty() {
        return "unnamed_file".to_string();
    }

    if sanitized.len() > MAX_FILENAME_BYTES {
        let (stem, ext) = match sanitized.rfind('.') {
            Some(dot) if sanitized.len() - dot <= 16 => sanitized.split_at(dot),
            _ => (sanitized, ""),
        };
        let stem = truncate_at_char_boundary(stem, MAX_FILENAME_BYTES - ext.len());
        return format!("{}{}", stem, ext);
    }

    sanitized.to_string()
}

/// Case-insensitive extension check against a list of extensions (no dot).
pub fn has_extension(path: impl AsRef<Path>, extensions: &[&str]) -> bool {
    path.as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_removes_path_components() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\scores\\bach.xml"), "bach.xml");
        assert_eq!(sanitize_filename("/files/score.xml"), "score.xml");
    }

    #[test]
    fn test_sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_filename("file<>:test.xml"), "file___test.xml");
        assert_eq!(sanitize_filename("my score?.xml"), "my_score_.xml");
    }

    #[test]
    fn test_sanitize_rejects_dot_names() {
        assert_eq!(sanitize_filename(".."), "unnamed_file");
        assert_eq!(sanitize_filename("."), "unnamed_file");
    }

    #[test]
    fn test_sanitize_handles_empty() {
        assert_eq!(sanitize_filename(""), "unnamed_file");
        assert_eq!(sanitize_filename("   "), "unnamed_file");
        assert_eq!(sanitize_filename("dir/"), "unnamed_file");
    }

    #[test]
    fn test_sanitize_truncates_long_names() {
        let long_name = format!("{}.musicxml", "a".repeat(300));
        let sanitized = sanitize_filename(&long_name);
        assert!(sanitized.len() <= MAX_FILENAME_BYTES);
        assert!(sanitized.ends_with(".musicxml"));
    }

    #[test]
    fn test_sanitize_truncates_multibyte_safely() {
        let long_name = format!("{}.xml", "é".repeat(150));
        let sanitized = sanitize_filename(&long_name);
        assert!(sanitized.len() <= MAX_FILENAME_BYTES);
        assert!(sanitized.ends_with(".xml"));
    }

    #[test]
    fn test_has_extension_case_insensitive() {
        assert!(has_extension("score.XML", &["xml", "musicxml"]));
        assert!(has_extension("a/b/score.musicxml", &["xml", "musicxml"]));
        assert!(!has_extension("score.mxl", &["xml", "musicxml"]));
        assert!(!has_extension("score", &["xml"]));
    }
}
