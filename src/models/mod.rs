//! Domain model module declarations.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};

pub mod chunk;
pub mod heartbeat;
pub mod message;
pub mod request;

/// Deserialize a timestamp written by either side of the mailbox.
///
/// The collaborator may emit RFC 3339 values or naive ISO 8601 values
/// without an offset. Naive values are taken as UTC.
pub(crate) fn deserialize_timestamp<'de, D>(
    deserializer: D,
) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| {
        serde::de::Error::custom(format!("unrecognised timestamp: {raw}"))
    })
}

/// Parse an RFC 3339 or naive ISO 8601 timestamp.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
