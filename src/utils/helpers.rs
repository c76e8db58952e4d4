//! Utility functions for sagebot.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;

/// Ensure a directory exists, creating it if necessary.
pub fn ensure_dir(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref().to_path_buf();
    if !path.exists() {
        let _ = fs::create_dir_all(&path);
    }
    path
}

/// Get the sagebot data directory (~/.sagebot).
pub fn get_data_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    ensure_dir(home.join(".sagebot"))
}

/// Get the archive storage directory.
pub fn get_archive_path() -> PathBuf {
    ensure_dir(get_data_path().join("archive"))
}

/// Get current timestamp in ISO format.
pub fn timestamp() -> String {
    Local::now().to_rfc3339()
}

/// Find the largest byte index `<= idx` that lies on a UTF-8 char boundary.
pub fn floor_char_boundary(s: &str, idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    let mut i = idx;
    while !s.is_char_boundary(i) && i > 0 {
        i -= 1;
    }
    i
}

/// Truncate a string to max length, adding a suffix if truncated.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    let suffix = "...";
    if s.len() <= max_len {
        return s.to_string();
    }
    if max_len <= suffix.len() {
        let end = floor_char_boundary(s, max_len);
        return s[..end].to_string();
    }
    let end = floor_char_boundary(s, max_len - suffix.len());
    let mut result = s[..end].to_string();
    result.push_str(suffix);
    result
}

/// Convert a string to a safe filename by replacing unsafe characters with underscores.
pub fn safe_filename(name: &str) -> String {
    const UNSAFE_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    let mut result = name.to_string();
    for &ch in UNSAFE_CHARS {
        result = result.replace(ch, "_");
    }
    result.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_string() {
        assert_eq!(truncate_string("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_long_string() {
        assert_eq!(truncate_string("hello world", 8), "hello...");
    }

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("user:42"), "user_42");
        assert_eq!(safe_filename("a<b>c"), "a_b_c");
    }

    #[test]
    fn test_floor_char_boundary_ascii() {
        assert_eq!(floor_char_boundary("hello", 3), 3);
        assert_eq!(floor_char_boundary("hello", 10), 5);
        assert_eq!(floor_char_boundary("hello", 0), 0);
    }

    #[test]
    fn test_truncate_string_multibyte() {
        // Should not panic on multi-byte strings.
        let s = "café résumé";
        let t = truncate_string(s, 6);
        assert!(t.ends_with("..."));
    }

    #[test]
    fn test_ensure_dir_creates() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let created = ensure_dir(&nested);
        assert!(created.exists());
    }
}
