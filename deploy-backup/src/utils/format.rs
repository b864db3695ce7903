//! Human-readable formatting for sizes, ages and timestamps.

use chrono::{DateTime, Utc};

/// Timestamp format used in generated backup and snapshot names.
pub const NAME_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Format bytes in human-readable form (B, KB, MB, GB, TB)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format an age in seconds as `3d 4h`, `2h 5m` or `42s`.
pub fn format_age(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3600;
    let minutes = (seconds % 3600) / 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}

/// Compact UTC stamp for names, e.g. `20261018_093000`.
pub fn name_timestamp(at: DateTime<Utc>) -> String {
    at.format(NAME_TIMESTAMP_FORMAT).to_string()
}

/// Collapse multi-line command output into one line, joining lines with ` | `.
pub fn single_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1_572_864), "1.50 MB");
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(42), "42s");
        assert_eq!(format_age(125), "2m 5s");
        assert_eq!(format_age(7_500), "2h 5m");
        assert_eq!(format_age(3 * 86_400 + 4 * 3600), "3d 4h");
    }

    #[test]
    fn test_name_timestamp() {
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 9, 30, 0).unwrap();
        assert_eq!(name_timestamp(at), "20261018_093000");
    }

    #[test]
    fn test_single_line() {
        assert_eq!(single_line("plain"), "plain");
        assert_eq!(
            single_line("realm export failed: WARN line\n\n  ERROR realm not found\n"),
            "realm export failed: WARN line | ERROR realm not found"
        );
    }
}
