//! Key layout.
//!
//! Every key of one thread carries the `{t:<thread>}` hash tag so a script
//! touching a thread stays inside one cluster slot. Thread ids, namespaces
//! and task ids are escaped before they are embedded, which keeps `:` and
//! `|` usable as separators. The Lua scripts in [`crate::script`] rebuild
//! the `:ns:`, `:index`, `:cp:` and `:w:` suffixes and must stay in sync.

use chatstate_core::namespace::{escape_component, unescape_component};
use chatstate_core::{StoreConfig, StoreError, ThreadKey};

#[derive(Debug, Clone)]
pub struct KeyLayout {
    checkpoints: String,
    store: String,
}

impl KeyLayout {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            checkpoints: format!("{}:{}", config.key_prefix(), config.checkpoint_collection()),
            store: format!("{}:{}:{{store}}", config.key_prefix(), config.store_collection()),
        }
    }

    /// Prefix shared by all keys of one thread.
    pub fn thread_base(&self, thread_id: &str) -> String {
        format!("{}:{{t:{}}}", self.checkpoints, escape_component(thread_id))
    }

    pub fn namespaces(&self, thread_id: &str) -> String {
        format!("{}:namespaces", self.thread_base(thread_id))
    }

    pub fn partition(&self, key: &ThreadKey) -> PartitionKeys {
        PartitionKeys::new(self, &key.thread_id, &key.checkpoint_ns)
    }

    /// Sorted set of thread ids scored by their last write (epoch millis).
    pub fn threads(&self) -> String {
        format!("{}:threads", self.checkpoints)
    }

    /// Sorted set of [`ExpiryEntry`] members scored by `expire_at` (epoch millis).
    pub fn expiry(&self) -> String {
        format!("{}:expiry", self.checkpoints)
    }

    pub fn profile_document(&self, document_id: &str) -> String {
        format!("{}:doc:{document_id}", self.store)
    }

    pub fn profile_index(&self) -> String {
        format!("{}:index", self.store)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionKeys {
    pub thread_id: String,
    pub checkpoint_ns: String,
    pub escaped_ns: String,
    pub partition: String,
    pub index: String,
    pub namespaces: String,
}

impl PartitionKeys {
    pub fn new(layout: &KeyLayout, thread_id: &str, checkpoint_ns: &str) -> Self {
        let escaped_ns = escape_component(checkpoint_ns);
        let partition = format!("{}:ns:{escaped_ns}", layout.thread_base(thread_id));
        Self {
            thread_id: thread_id.to_string(),
            checkpoint_ns: checkpoint_ns.to_string(),
            index: format!("{partition}:index"),
            namespaces: layout.namespaces(thread_id),
            escaped_ns,
            partition,
        }
    }

    pub fn checkpoint_prefix(&self) -> String {
        format!("{}:cp:", self.partition)
    }

    pub fn writes_prefix(&self) -> String {
        format!("{}:w:", self.partition)
    }

    pub fn checkpoint(&self, checkpoint_id: &str) -> String {
        format!("{}{checkpoint_id}", self.checkpoint_prefix())
    }

    pub fn writes(&self, checkpoint_id: &str) -> String {
        format!("{}{checkpoint_id}", self.writes_prefix())
    }
}

/// Member of the expiry index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryEntry {
    Partition {
        thread_id: String,
        checkpoint_ns: String,
    },
    Checkpoint {
        thread_id: String,
        checkpoint_ns: String,
        checkpoint_id: String,
    },
}

impl ExpiryEntry {
    pub fn member(&self) -> String {
        match self {
            ExpiryEntry::Partition {
                thread_id,
                checkpoint_ns,
            } => format!(
                "p|{}|{}",
                escape_component(thread_id),
                escape_component(checkpoint_ns)
            ),
            ExpiryEntry::Checkpoint {
                thread_id,
                checkpoint_ns,
                checkpoint_id,
            } => format!(
                "c|{}|{}|{}",
                escape_component(thread_id),
                escape_component(checkpoint_ns),
                escape_component(checkpoint_id)
            ),
        }
    }

    pub fn parse(member: &str) -> Result<Self, StoreError> {
        let invalid = || StoreError::serialization("expiry index member", format!("'{member}'"));
        let parts: Vec<&str> = member.split('|').collect();
        match parts.as_slice() {
            ["p", thread, ns] => Ok(ExpiryEntry::Partition {
                thread_id: unescape_component(thread)?,
                checkpoint_ns: unescape_component(ns)?,
            }),
            ["c", thread, ns, id] => Ok(ExpiryEntry::Checkpoint {
                thread_id: unescape_component(thread)?,
                checkpoint_ns: unescape_component(ns)?,
                checkpoint_id: unescape_component(id)?,
            }),
            _ => Err(invalid()),
        }
    }

    pub fn thread_key(&self) -> ThreadKey {
        match self {
            ExpiryEntry::Partition {
                thread_id,
                checkpoint_ns,
            } => ThreadKey::new(thread_id.as_str()).with_namespace(checkpoint_ns.as_str()),
            ExpiryEntry::Checkpoint {
                thread_id,
                checkpoint_ns,
                checkpoint_id,
            } => ThreadKey::new(thread_id.as_str())
                .with_namespace(checkpoint_ns.as_str())
                .at(checkpoint_id.as_str()),
        }
    }
}

/// Checkpoint ids are embedded in keys unescaped; ids from callers must not
/// break the layout.
pub fn safe_checkpoint_id(checkpoint_id: &str) -> Result<&str, StoreError> {
    let unsafe_char = |c: char| {
        matches!(c, ':' | '{' | '}' | '|' | '*' | '?') || c.is_whitespace() || c.is_control()
    };
    if checkpoint_id.chars().any(unsafe_char) {
        return Err(StoreError::validation(format!(
            "checkpoint_id contains characters invalid in Redis keys: {checkpoint_id:?}"
        )));
    }
    Ok(checkpoint_id)
}
