//! UTF-8 safe string manipulation.
//!
//! Truncation operates on codepoint sequences, never byte indexes, so
//! multi-byte characters are never split.

/// Truncate a string to at most `max_chars` codepoints, appending `suffix`
/// if truncated. The suffix counts against the budget.
pub fn truncate_chars(s: &str, max_chars: usize, suffix: &str) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let keep = max_chars.saturating_sub(suffix.chars().count());
    let mut out: String = s.chars().take(keep).collect();
    out.push_str(suffix);
    out
}
