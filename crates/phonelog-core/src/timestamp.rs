//! Timestamp parsing for location items.
//!
//! Phones report time either as a numeric epoch (seconds or milliseconds) or
//! as ISO-8601 text. [`parse_timestamp`] resolves both into epoch
//! milliseconds plus a canonical text form, or `None` when the value cannot
//! be interpreted. A missing or bad timestamp is a drop, never an error.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Timelike};
use serde_json::Value;

use crate::SECONDS_THRESHOLD;

/// A resolved timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTimestamp {
    /// Canonical text form: `YYYY-MM-DDTHH:MM:SS[.ffffff]±HH:MM`.
    pub iso8601: String,

    /// Milliseconds since the Unix epoch.
    pub epoch_millis: i64,
}

/// Formats tried for text that carries an explicit offset.
const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M%:z",
    "%Y-%m-%d %H:%M%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];

/// Formats tried for text without an offset (interpreted as UTC).
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse a timestamp value from a properties object.
///
/// - Numbers at or below [`SECONDS_THRESHOLD`] are epoch seconds, larger
///   numbers are epoch milliseconds. Fractional milliseconds are truncated.
/// - Strings are ISO-8601. `Z` means UTC and a missing offset defaults to UTC.
/// - Anything else (null, booleans, objects, unparseable text) is `None`.
pub fn parse_timestamp(value: &Value) -> Option<ParsedTimestamp> {
    match value {
        Value::Number(n) => parse_epoch(n),
        Value::String(s) => parse_text(s),
        _ => None,
    }
}

fn parse_epoch(n: &serde_json::Number) -> Option<ParsedTimestamp> {
    let millis = if let Some(i) = n.as_i64() {
        if i > SECONDS_THRESHOLD {
            i
        } else {
            i.checked_mul(1000)?
        }
    } else {
        let f = n.as_f64()?;
        if !f.is_finite() {
            return None;
        }
        let scaled = if f > SECONDS_THRESHOLD as f64 {
            f
        } else {
            f * 1000.0
        };
        if scaled.abs() >= i64::MAX as f64 {
            return None;
        }
        scaled.trunc() as i64
    };

    let dt = DateTime::from_timestamp_millis(millis)?.fixed_offset();
    Some(ParsedTimestamp {
        iso8601: format_iso8601(&dt),
        epoch_millis: millis,
    })
}

fn parse_text(text: &str) -> Option<ParsedTimestamp> {
    let text = text.trim().replace('Z', "+00:00");

    let dt = OFFSET_FORMATS
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(&text, fmt).ok())
        .or_else(|| {
            NAIVE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(&text, fmt).ok())
                .map(|naive| naive.and_utc().fixed_offset())
        })
        .or_else(|| {
            NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc().fixed_offset())
        })?;

    Some(ParsedTimestamp {
        iso8601: format_iso8601(&dt),
        epoch_millis: dt.timestamp_millis(),
    })
}

/// Render a timestamp the way existing stored nodes carry it: microsecond
/// precision only when non-zero, and always an explicit `±HH:MM` offset.
fn format_iso8601(dt: &DateTime<FixedOffset>) -> String {
    if dt.nanosecond() / 1000 == 0 {
        dt.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
    } else {
        dt.format("%Y-%m-%dT%H:%M:%S%.6f%:z").to_string()
    }
}
