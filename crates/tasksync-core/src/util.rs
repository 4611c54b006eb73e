//! Shared utility functions used across multiple modules.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, SecondsFormat, Utc};

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<&str>) -> Option<String> {
    let value = value?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Non-reversible user id hash for log lines.
pub fn user_fingerprint(user_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    user_id.hash(&mut hasher);
    hasher.finish()
}

/// Unix microseconds to a UTC timestamp, clamping out-of-range values to the epoch.
pub fn datetime_from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

/// RFC 3339 rendering with microsecond precision, as stored in text columns.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_option_rejects_empty() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some("   ")), None);
    }

    #[test]
    fn normalize_text_option_trims_value() {
        assert_eq!(
            normalize_text_option(Some(" phone-1 ")),
            Some("phone-1".to_string())
        );
    }

    #[test]
    fn timestamps_round_trip_through_text_and_micros() {
        let parsed = parse_timestamp("2024-03-01T10:15:30.123456+02:00").unwrap();
        assert_eq!(format_timestamp(&parsed), "2024-03-01T08:15:30.123456Z");
        assert_eq!(
            datetime_from_micros(parsed.timestamp_micros()),
            parsed
        );
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(user_fingerprint("u1"), user_fingerprint("u1"));
        assert_ne!(user_fingerprint("u1"), user_fingerprint("u2"));
    }
}
