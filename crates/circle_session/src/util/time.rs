#![forbid(unsafe_code)]

use chrono::{DateTime, SecondsFormat, Utc};

/// Current wall-clock time.
#[inline]
pub fn now() -> DateTime<Utc> {
	Utc::now()
}

/// Encode a timestamp as RFC 3339 with millisecond precision in UTC.
///
/// Fixed-width UTC encoding keeps lexicographic order equal to
/// chronological order, which the store relies on for `ORDER BY timestamp`.
#[inline]
pub fn encode_ts(ts: DateTime<Utc>) -> String {
	ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Decode an RFC 3339 timestamp.
#[inline]
pub fn decode_ts(s: &str) -> Option<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}
