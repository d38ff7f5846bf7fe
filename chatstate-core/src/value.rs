use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::StoreError;

pub type Value = serde_json::Value;

/// Schema-less profile document: a key-ordered map of JSON-like values.
pub type ProfileValue = serde_json::Map<String, Value>;

pub fn encode_json<T: Serialize + ?Sized>(
    what: &'static str,
    value: &T,
) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|error| StoreError::serialization(what, error))
}

pub fn decode_json<T: DeserializeOwned>(what: &'static str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|error| StoreError::serialization(what, error))
}

/// RFC 3339 with fixed microsecond precision, so stored timestamps compare
/// correctly as plain strings.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(what: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|error| StoreError::serialization(what, error))
}
