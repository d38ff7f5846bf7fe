//! Hierarchical profile namespaces and their flat document ids.

use std::fmt;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};

use crate::StoreError;

pub const SEPARATOR: char = '/';

/// Characters escaped inside one id component: the separator, the escape
/// character itself, and characters with meaning in database keys.
const COMPONENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'%')
    .add(b'/')
    .add(b':')
    .add(b'{')
    .add(b'}')
    .add(b'[')
    .add(b']')
    .add(b'*')
    .add(b'?')
    .add(b'|');

pub fn escape_component(raw: &str) -> String {
    utf8_percent_encode(raw, COMPONENT).to_string()
}

pub fn unescape_component(escaped: &str) -> Result<String, StoreError> {
    percent_decode_str(escaped)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|error| StoreError::serialization("document id component", error))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(Vec<String>);

impl Namespace {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// The empty path; as a search prefix it matches every namespace.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn starts_with(&self, prefix: &Namespace) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn ends_with(&self, suffix: &Namespace) -> bool {
        self.0.ends_with(&suffix.0)
    }

    pub fn truncated(&self, depth: usize) -> Namespace {
        Self(self.0.iter().take(depth).cloned().collect())
    }

    /// Record addresses need at least one segment and no empty segments.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.0.is_empty() {
            return Err(StoreError::validation("namespace path must not be empty"));
        }
        self.validate_prefix()
    }

    /// Search prefixes may be empty, but their segments may not.
    pub fn validate_prefix(&self) -> Result<(), StoreError> {
        if self.0.iter().any(|segment| segment.is_empty()) {
            return Err(StoreError::validation(format!(
                "namespace {self} contains an empty segment"
            )));
        }
        Ok(())
    }

    /// Escaped segments each followed by the separator. Every document id
    /// under this namespace (at any depth) starts with this string and no
    /// other document id does.
    pub fn id_prefix(&self) -> String {
        let mut prefix = String::new();
        for segment in &self.0 {
            prefix.push_str(&escape_component(segment));
            prefix.push(SEPARATOR);
        }
        prefix
    }

    pub fn document_id(&self, key: &str) -> String {
        let mut id = self.id_prefix();
        id.push_str(&escape_component(key));
        id
    }

    /// Inverse of [`Namespace::document_id`].
    pub fn split_document_id(id: &str) -> Result<(Namespace, String), StoreError> {
        let mut components = id
            .split(SEPARATOR)
            .map(unescape_component)
            .collect::<Result<Vec<_>, _>>()?;
        let key = components
            .pop()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| StoreError::serialization("document id", format!("'{id}' has no key")))?;
        Ok((Namespace(components), key))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

impl From<Vec<String>> for Namespace {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

impl From<&[&str]> for Namespace {
    fn from(segments: &[&str]) -> Self {
        Self::new(segments.iter().copied())
    }
}

impl<const N: usize> From<[&str; N]> for Namespace {
    fn from(segments: [&str; N]) -> Self {
        Self::new(segments)
    }
}

pub fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::validation("profile key must not be empty"));
    }
    Ok(())
}
