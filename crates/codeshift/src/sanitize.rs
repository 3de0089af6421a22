//! Helpers for sanitizing data before it enters tracing span attributes.
//!
//! Source batches and collaborator output can contain customer code, so spans
//! only ever carry file names and bounded one-line summaries.

use std::path::Path;

/// Default upper bound for [`truncate_detail`].
pub const DETAIL_LIMIT: usize = 200;

/// Returns only the filename component of a path (no directory).
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Collapses `detail` to a single line of at most `max_chars` characters.
///
/// Whitespace runs (including newlines) become one space; an ellipsis marks
/// truncation.
pub fn truncate_detail(detail: &str, max_chars: usize) -> String {
    let flat = detail.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_path_returns_filename() {
        assert_eq!(
            redact_path(Path::new("/home/user/legacy/billing/ledger.pc")),
            "ledger.pc"
        );
    }

    #[test]
    fn test_redact_path_no_filename() {
        assert_eq!(redact_path(Path::new("/")), "<unknown>");
    }

    #[test]
    fn test_truncate_detail_flattens_lines() {
        assert_eq!(
            truncate_detail("error: x\n  at main.c:3\n", 100),
            "error: x at main.c:3"
        );
    }

    #[test]
    fn test_truncate_detail_bounds_length() {
        let long = "a".repeat(500);
        let out = truncate_detail(&long, 20);
        assert_eq!(out.chars().count(), 20);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn test_truncate_detail_multibyte_safe() {
        let out = truncate_detail("ééééééééééé", 6);
        assert_eq!(out, "ééé...");
    }
}
