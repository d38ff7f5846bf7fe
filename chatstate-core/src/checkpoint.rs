//! Thread-scoped checkpoint history.
//!
//! A *partition* is one (thread id, namespace) pair. Every partition holds an
//! append-only history of checkpoints ordered by id, a pointer to the latest
//! one, and the pending writes recorded against each checkpoint.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::ttl::Stamp;
use crate::{StoreError, Value};

/// Address of a partition, optionally pinned to one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadKey {
    pub thread_id: String,
    #[serde(default)]
    pub checkpoint_ns: String,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
}

impl ThreadKey {
    /// Latest checkpoint of `thread_id` in the root namespace.
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_ns: String::new(),
            checkpoint_id: None,
        }
    }

    pub fn with_namespace(mut self, checkpoint_ns: impl Into<String>) -> Self {
        self.checkpoint_ns = checkpoint_ns.into();
        self
    }

    pub fn at(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    /// Same partition, unpinned.
    pub fn latest(&self) -> Self {
        Self {
            checkpoint_id: None,
            ..self.clone()
        }
    }

    pub fn partition(&self) -> (&str, &str) {
        (&self.thread_id, &self.checkpoint_ns)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        validate_thread_id(&self.thread_id)?;
        if matches!(&self.checkpoint_id, Some(id) if id.is_empty()) {
            return Err(StoreError::validation("checkpoint_id must not be empty"));
        }
        Ok(())
    }

    /// The pinned checkpoint id, required by operations on one checkpoint.
    pub fn require_checkpoint_id(&self) -> Result<&str, StoreError> {
        self.validate()?;
        self.checkpoint_id.as_deref().ok_or_else(|| {
            StoreError::validation(format!(
                "thread '{}' key has no checkpoint_id",
                self.thread_id
            ))
        })
    }
}

pub fn validate_thread_id(thread_id: &str) -> Result<(), StoreError> {
    if thread_id.is_empty() {
        return Err(StoreError::validation("thread_id must not be empty"));
    }
    if thread_id.chars().any(char::is_control) {
        return Err(StoreError::validation(format!(
            "thread_id contains control characters: {thread_id:?}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    #[default]
    Input,
    Loop,
    Update,
    Fork,
}

impl fmt::Display for CheckpointSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            CheckpointSource::Input => "input",
            CheckpointSource::Loop => "loop",
            CheckpointSource::Update => "update",
            CheckpointSource::Fork => "fork",
        })
    }
}

/// Metadata keys carried by [`CheckpointMetadata`]'s typed fields.
pub const RESERVED_METADATA_KEYS: [&str; 2] = ["source", "step"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointMetadata {
    pub source: CheckpointSource,
    pub step: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl CheckpointMetadata {
    pub fn new(source: CheckpointSource, step: i64) -> Self {
        Self {
            source,
            step,
            extra: serde_json::Map::new(),
        }
    }

    /// Adds an extra field. `source` and `step` are reserved for the typed
    /// fields; stores reject metadata that repeats them in `extra`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Fails when `extra` shadows a typed field, which would encode the key
    /// twice and make the stored record undecodable.
    pub fn validate(&self) -> Result<(), StoreError> {
        match RESERVED_METADATA_KEYS
            .iter()
            .find(|key| self.extra.contains_key(**key))
        {
            Some(key) => Err(StoreError::validation(format!(
                "metadata key '{key}' is reserved, set the typed field instead"
            ))),
            None => Ok(()),
        }
    }

    /// Flat view including `source` and `step`, as used by list filters.
    pub fn to_map(&self) -> serde_json::Map<String, Value> {
        let mut map = self.extra.clone();
        map.insert(
            "source".to_string(),
            serde_json::to_value(self.source).unwrap_or(Value::Null),
        );
        map.insert("step".to_string(), Value::from(self.step));
        map
    }

    /// True when every filter pair is present with an equal value.
    pub fn matches(&self, filter: &BTreeMap<String, Value>) -> bool {
        if filter.is_empty() {
            return true;
        }
        let map = self.to_map();
        filter
            .iter()
            .all(|(key, expected)| map.get(key) == Some(expected))
    }
}

/// Intermediate output of one task, recorded against a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub task_id: String,
    pub index: usize,
    pub channel: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub thread_id: String,
    pub checkpoint_ns: String,
    pub latest_checkpoint_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
}

impl PartitionRecord {
    pub fn stamp(&self) -> Stamp {
        Stamp {
            created_at: self.created_at,
            expire_at: self.expire_at,
        }
    }
}

/// A checkpoint together with its metadata, parent and pending writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointTuple {
    /// Always pinned to this checkpoint's id.
    pub key: ThreadKey,
    pub checkpoint: Value,
    pub metadata: CheckpointMetadata,
    pub parent_key: Option<ThreadKey>,
    pub pending_writes: Vec<PendingWrite>,
    pub created_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
}

impl CheckpointTuple {
    pub fn checkpoint_id(&self) -> &str {
        self.key.checkpoint_id.as_deref().unwrap_or_default()
    }

    pub fn parent_checkpoint_id(&self) -> Option<&str> {
        self.parent_key
            .as_ref()
            .and_then(|parent| parent.checkpoint_id.as_deref())
    }

    /// Expired checkpoints may still be readable until a sweep removes them;
    /// callers decide whether to resume from one.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at <= now
    }

    pub fn state_as<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.checkpoint.clone())
            .map_err(|error| StoreError::serialization("checkpoint state", error))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListOptions {
    /// Metadata pairs that must all match.
    pub filter: BTreeMap<String, Value>,
    /// Only checkpoints with ids strictly less than this one.
    pub before: Option<String>,
    pub limit: Option<usize>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(key.into(), value.into());
        self
    }

    pub fn before(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.before = Some(checkpoint_id.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

pub type CheckpointStream<'a> = BoxStream<'a, Result<CheckpointTuple, StoreError>>;

#[async_trait::async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Appends a checkpoint after `key.checkpoint_id` (its parent) and moves
    /// the partition pointer to it. Returns the key pinned to the new id.
    async fn put(
        &self,
        key: &ThreadKey,
        checkpoint: Value,
        metadata: CheckpointMetadata,
    ) -> Result<ThreadKey, StoreError>;

    /// Records `(channel, value)` writes of `task_id` against the pinned
    /// checkpoint. A write at an existing (task, index) replaces it.
    async fn put_writes(
        &self,
        key: &ThreadKey,
        writes: Vec<(String, Value)>,
        task_id: &str,
    ) -> Result<(), StoreError>;

    /// The pinned checkpoint, or the latest one when `key` is unpinned.
    async fn get_tuple(&self, key: &ThreadKey) -> Result<Option<CheckpointTuple>, StoreError>;

    /// Checkpoints of the partition, newest first. The stream is lazy and
    /// can be restarted by calling `list` again.
    fn list<'a>(&'a self, key: &'a ThreadKey, options: ListOptions) -> CheckpointStream<'a>;

    /// Removes every partition, checkpoint and pending write of the thread.
    async fn delete_thread(&self, thread_id: &str) -> Result<(), StoreError>;

    async fn get_partition(&self, key: &ThreadKey) -> Result<Option<PartitionRecord>, StoreError>;

    async fn get(&self, key: &ThreadKey) -> Result<Option<Value>, StoreError> {
        Ok(self.get_tuple(key).await?.map(|tuple| tuple.checkpoint))
    }
}
