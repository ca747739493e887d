//! Text utilities shared by the log pipeline and the diagnosis turn machine.
//!
//! All helpers are UTF-8 safe: they count characters, never bytes, so a
//! multi-byte character is never split.

/// Truncates a string to a maximum number of characters, adding "..." if truncated.
///
/// # Examples
///
/// ```
/// use lab_core::truncate_with_ellipsis;
///
/// assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
/// assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
/// ```
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some((byte_idx, _)) => format!("{}...", &s[..byte_idx]),
    }
}

/// Keeps at most the last `max_chars` characters of `s`.
pub fn tail_chars(s: &str, max_chars: usize) -> &str {
    let total = s.chars().count();
    if total <= max_chars {
        return s;
    }
    let skip = total - max_chars;
    let byte_idx = s
        .char_indices()
        .nth(skip)
        .map(|(idx, _)| idx)
        .unwrap_or(s.len());
    &s[byte_idx..]
}

/// True when the string is empty or whitespace only.
pub fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}
