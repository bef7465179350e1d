//! Timestamp and identifier coercion used when normalizing upstream payloads.
//!
//! The free-tier API reports times as epoch seconds while the PRO API uses
//! ISO-8601 strings. Deserializing through these helpers gives both tiers the
//! same epoch-second shape.

use chrono::{DateTime, NaiveDateTime};
use serde::{de, Deserialize, Deserializer};
use serde_json::Value;

/// Parse an ISO-8601 timestamp into epoch seconds.
///
/// Accepts RFC 3339 (`Z` or offset) and offset-less date-times, the latter
/// read as UTC.
pub fn iso_to_epoch_seconds(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc().timestamp())
}

/// Read a timestamp given as epoch seconds (integer, float or numeric string)
/// or as an ISO-8601 string.
pub fn epoch_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| iso_to_epoch_seconds(s)),
        _ => None,
    }
}

/// Deserialize an optional timestamp in any form [`epoch_seconds`] accepts.
pub fn deserialize_epoch_seconds<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => epoch_seconds(&value)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("unparseable timestamp: {}", value))),
    }
}

/// Deserialize an optional identifier that upstream may send as a string or a
/// number.
pub fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(de::Error::custom(format!("unexpected identifier value: {}", other))),
    }
}
