//! Helper utility functions for CLI commands

/// Safely truncate a string to a maximum number of characters (not bytes).
/// This avoids panics when slicing multi-byte UTF-8 characters.
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    let char_count = s.chars().count();
    if char_count > max_chars {
        let truncated: String = s.chars().take(max_chars).collect();
        format!("{truncated}...")
    } else {
        s.to_string()
    }
}

/// `mm:ss` below an hour, `1h 05m` above
pub fn format_duration_ms(ms: i64) -> String {
    let seconds = ms.max(0) / 1000;
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    if hours > 0 {
        format!("{hours}h {minutes:02}m")
    } else {
        format!("{minutes:02}:{:02}", seconds % 60)
    }
}

/// Units are seconds at 1.0x, so show them as time as well
pub fn format_units(units: i64) -> String {
    let sign = if units < 0 { "-" } else { "" };
    format!(
        "{units} DU ({sign}{})",
        format_duration_ms(units.saturating_abs().saturating_mul(1000))
    )
}

pub fn rule(width: usize) -> String {
    "=".repeat(width)
}
