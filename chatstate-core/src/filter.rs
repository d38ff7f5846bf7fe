use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{ProfileValue, Value};

/// Predicate over the fields of a profile value.
///
/// Keys address top-level fields; a dotted key (`"contact.email"`) walks
/// nested objects.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum ValueFilter {
    Eq(String, Value),
    In(String, Vec<Value>),
    /// Inclusive bounds over numbers, or over strings compared lexicographically.
    Range {
        key: String,
        min: Option<Value>,
        max: Option<Value>,
    },
    All(Vec<ValueFilter>),
    Any(Vec<ValueFilter>),
}

impl ValueFilter {
    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        ValueFilter::Eq(key.into(), value.into())
    }

    pub fn matches(&self, value: &ProfileValue) -> bool {
        match self {
            ValueFilter::Eq(key, expected) => {
                lookup(value, key).map_or(false, |entry| entry == expected)
            }
            ValueFilter::In(key, candidates) => lookup(value, key)
                .map_or(false, |entry| candidates.iter().any(|candidate| candidate == entry)),
            ValueFilter::Range { key, min, max } => {
                let Some(entry) = lookup(value, key) else {
                    return false;
                };
                if let Some(min) = min {
                    if !matches!(compare(entry, min), Some(Ordering::Greater | Ordering::Equal)) {
                        return false;
                    }
                }
                if let Some(max) = max {
                    if !matches!(compare(entry, max), Some(Ordering::Less | Ordering::Equal)) {
                        return false;
                    }
                }
                true
            }
            ValueFilter::All(filters) => filters.iter().all(|filter| filter.matches(value)),
            ValueFilter::Any(filters) => filters.iter().any(|filter| filter.matches(value)),
        }
    }
}

fn lookup<'a>(value: &'a ProfileValue, key: &str) -> Option<&'a Value> {
    let mut segments = key.split('.');
    let mut current = value.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(left), Value::Number(right)) => left.as_f64()?.partial_cmp(&right.as_f64()?),
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        _ => None,
    }
}
