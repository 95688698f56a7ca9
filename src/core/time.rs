//! Shared timestamp/event helpers for deterministic cache text.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use ulid::Ulid;

/// Drops sub-second precision so cache text is stable across encodes.
pub fn truncate_secs(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.timestamp(), 0).single().unwrap_or(ts)
}

/// Returns `YYYY-MM-DDTHH:MM:SSZ`.
pub fn iso_utc(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parses an RFC 3339 timestamp, normalised to UTC whole seconds.
pub fn parse_iso(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| truncate_secs(dt.with_timezone(&Utc)))
}

pub fn from_epoch(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

pub fn now_utc() -> DateTime<Utc> {
    truncate_secs(Utc::now())
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Serde adapter used by every cached timestamp.
///
/// Writes RFC 3339 at whole-second precision. Reads RFC 3339 strings and, for
/// caches written by older bots, plain epoch seconds.
pub mod iso {
    use chrono::{DateTime, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::iso_utc(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = serde_json::Value::deserialize(d)?;
        super::from_json(&raw)
            .ok_or_else(|| D::Error::custom(format!("unparseable timestamp: {}", raw)))
    }
}

/// Accepts either an RFC 3339 string or epoch seconds (integer or float).
pub fn from_json(raw: &serde_json::Value) -> Option<DateTime<Utc>> {
    match raw {
        serde_json::Value::String(s) => parse_iso(s),
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_epoch),
        _ => None,
    }
}
