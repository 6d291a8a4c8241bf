//! Shared utility functions for the partgen crate.

/// Strip a leading UTF-8 byte order mark and surrounding whitespace.
pub fn strip_bom_and_trim(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text).trim()
}

/// Shorten text for a log line, appending an ellipsis when cut.
pub fn truncate_for_log(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut)
}

/// Lowercased, whitespace-collapsed form used for name comparisons.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
