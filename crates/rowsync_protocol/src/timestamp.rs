//! ISO-8601 timestamp helpers.
//!
//! Rows carry their timestamps as strings so that malformed values can be
//! stored and propagated untouched. Comparisons always go through [`parse`];
//! a value that cannot be parsed falls back to an epoch and therefore never
//! wins a conflict.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use std::cmp::Ordering;

/// Epoch used for local rows with a missing or malformed timestamp.
pub const LOCAL_EPOCH: &str = "1970-01-01T00:00:00Z";

/// Epoch used for remote rows with a missing or malformed timestamp.
pub const REMOTE_EPOCH: &str = "2000-01-01T00:00:00Z";

const REMOTE_EPOCH_SECS: i64 = 946_684_800;

/// Which fallback applies to an unparseable timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Epoch {
    /// `1970-01-01T00:00:00Z`.
    Local,
    /// `2000-01-01T00:00:00Z`.
    Remote,
}

impl Epoch {
    /// Returns the epoch as a UTC datetime.
    pub fn datetime(self) -> DateTime<Utc> {
        let secs = match self {
            Epoch::Local => 0,
            Epoch::Remote => REMOTE_EPOCH_SECS,
        };
        Utc.timestamp_opt(secs, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Returns the epoch in its canonical string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Epoch::Local => LOCAL_EPOCH,
            Epoch::Remote => REMOTE_EPOCH,
        }
    }
}

/// Returns the current time as RFC 3339 with millisecond precision.
pub fn now() -> String {
    format(Utc::now())
}

/// Formats a datetime the way rowsync writes timestamps.
pub fn format(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses an ISO-8601 timestamp.
///
/// Accepts RFC 3339 (`2024-01-02T03:04:05.678Z`, offsets allowed) and the
/// zone-less `YYYY-MM-DD HH:MM:SS[.fff]` / `YYYY-MM-DDTHH:MM:SS[.fff]`
/// forms, which are read as UTC.
pub fn parse(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Parses `value`, substituting `epoch` when it is missing or malformed.
pub fn parse_or_epoch(value: Option<&str>, epoch: Epoch) -> DateTime<Utc> {
    value.and_then(parse).unwrap_or_else(|| epoch.datetime())
}

/// Compares two timestamp strings by instant.
///
/// Unparseable values sort before every parseable one; two unparseable
/// values compare as strings.
pub fn compare(a: &str, b: &str) -> Ordering {
    match (parse(a), parse(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

/// Returns the later of two optional timestamps.
pub fn later_of(a: Option<&str>, b: Option<&str>) -> Option<String> {
    match (a, b) {
        (Some(a), Some(b)) => {
            if compare(b, a) == Ordering::Greater {
                Some(b.to_string())
            } else {
                Some(a.to_string())
            }
        }
        (Some(a), None) => Some(a.to_string()),
        (None, Some(b)) => Some(b.to_string()),
        (None, None) => None,
    }
}
