//! Small string helpers shared across modules.

use serde_json::Value;

/// Find the largest valid UTF-8 boundary at or before the given byte index.
#[inline]
fn safe_byte_boundary(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    s.char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= max_bytes)
        .last()
        .unwrap_or(0)
}

/// Truncate a string with a marker if it exceeds the maximum length (UTF-8 safe).
///
/// The max_len is in bytes, but truncation respects UTF-8 character
/// boundaries to avoid panics with multi-byte characters.
#[inline]
pub fn truncate_with_marker(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let boundary = safe_byte_boundary(s, max_len);
        format!("{}...[truncated]", &s[..boundary])
    }
}

/// Compact single-line JSON rendering of a value, truncated for log and
/// instruction text. Never fails; unrenderable values become "{}".
pub fn compact_json_preview(value: &Value, max_len: usize) -> String {
    let rendered = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    truncate_with_marker(&rendered, max_len)
}
