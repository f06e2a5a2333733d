//! Small helpers shared across the crate: clock, ids and output tails.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

/// Wall-clock instant recorded on artifacts and stage runs.
pub type Timestamp = DateTime<Utc>;

/// Current instant in UTC.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Current instant as RFC 3339 with microseconds, e.g. `2024-05-01T09:30:00.000123Z`.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Fresh random (v4) id for stage runs and staging directories.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Keeps the last `max_chars` characters of `text`, prefixed with `...` when cut.
///
/// Collaborator output can be arbitrarily long; diagnostics only keep the end,
/// where tools usually print the actual error.
#[must_use]
pub fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().skip(count - max_chars).collect();
    format!("...{kept}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_timestamp_parses_back() {
        let stamp = iso_timestamp();
        let parsed = DateTime::parse_from_rfc3339(&stamp).unwrap();
        assert_eq!(parsed.offset().local_minus_utc(), 0);
        assert!(stamp.ends_with('Z'));
    }

    #[test]
    fn test_uuids_are_distinct_v4() {
        let (a, b) = (generate_uuid(), generate_uuid());
        assert_ne!(a, b);
        assert_eq!(a.get_version_num(), 4);
    }

    #[test]
    fn test_tail_keeps_short_text() {
        assert_eq!(tail("exit 3", 10), "exit 3");
    }

    #[test]
    fn test_tail_keeps_end_of_long_text() {
        assert_eq!(tail("line one\nline two", 8), "...line two");
    }

    #[test]
    fn test_tail_counts_characters_not_bytes() {
        assert_eq!(tail("αβγδ", 2), "...γδ");
    }
}
