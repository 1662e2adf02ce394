//! Recency comparison for the last-write-wins driver.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDateTime};

const SQLITE_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Epoch milliseconds for the timestamp formats both stores produce.
///
/// Accepts RFC 3339 and SQLite `datetime('now')` output (treated as UTC).
pub fn parse_timestamp_millis(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.timestamp_millis());
    }
    SQLITE_DATETIME_FORMATS.iter().find_map(|format| {
        NaiveDateTime::parse_from_str(raw, format)
            .ok()
            .map(|naive| naive.and_utc().timestamp_millis())
    })
}

/// Orders two recency markers. A missing marker is older than any present one.
///
/// Falls back to lexical ordering when either value cannot be parsed.
pub fn compare_recency(local: Option<&str>, cloud: Option<&str>) -> Ordering {
    match (local, cloud) {
        (None, None) => Ordering::Equal,
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (Some(local), Some(cloud)) => {
            match (parse_timestamp_millis(local), parse_timestamp_millis(cloud)) {
                (Some(local_ts), Some(cloud_ts)) => local_ts.cmp(&cloud_ts),
                _ => local.cmp(cloud),
            }
        }
    }
}

/// True when the local row should overwrite the cloud row.
///
/// Strictly newer only; equal timestamps leave the cloud untouched.
pub fn local_is_newer(local: Option<&str>, cloud: Option<&str>) -> bool {
    compare_recency(local, cloud) == Ordering::Greater
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_local_timestamp_wins() {
        assert!(local_is_newer(
            Some("2026-01-01T00:00:01.000Z"),
            Some("2026-01-01T00:00:00.000Z")
        ));
        assert!(!local_is_newer(
            Some("2026-01-01T00:00:00.000Z"),
            Some("2026-01-01T00:00:01.000Z")
        ));
    }

    #[test]
    fn equal_timestamps_do_not_overwrite() {
        assert!(!local_is_newer(
            Some("2026-01-01T00:00:00Z"),
            Some("2026-01-01T00:00:00.000Z")
        ));
    }

    #[test]
    fn uses_timestamp_value_not_lexical_format() {
        assert!(!local_is_newer(
            Some("2026-01-01T01:00:00+01:00"),
            Some("2026-01-01T00:00:00Z")
        ));
        assert_eq!(
            compare_recency(Some("2026-01-01T01:00:00+01:00"), Some("2026-01-01T00:00:00Z")),
            Ordering::Equal
        );
    }

    #[test]
    fn sqlite_datetime_compares_against_rfc3339() {
        assert!(local_is_newer(
            Some("2026-01-01 00:00:05"),
            Some("2026-01-01T00:00:00.000Z")
        ));
    }

    #[test]
    fn missing_marker_counts_as_oldest() {
        assert!(local_is_newer(Some("2020-01-01T00:00:00Z"), None));
        assert!(!local_is_newer(None, Some("2020-01-01T00:00:00Z")));
        assert!(!local_is_newer(None, None));
    }

    #[test]
    fn unparseable_values_fall_back_to_lexical_order() {
        assert!(local_is_newer(Some("b"), Some("a")));
    }
}
