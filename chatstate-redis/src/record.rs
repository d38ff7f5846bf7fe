//! Decoding of stored hashes back into domain records.

use std::collections::HashMap;

use chatstate_core::{
    decode_json, parse_timestamp, CheckpointMetadata, CheckpointTuple, Namespace, PartitionRecord,
    PendingWrite, ProfileItem, StoreError, ThreadKey, Value,
};

pub type Hash = HashMap<String, String>;

fn field<'a>(hash: &'a Hash, what: &'static str, name: &str) -> Result<&'a str, StoreError> {
    hash.get(name)
        .map(String::as_str)
        .ok_or_else(|| StoreError::serialization(what, format!("missing field '{name}'")))
}

pub fn partition(key: &ThreadKey, hash: &Hash) -> Result<PartitionRecord, StoreError> {
    const WHAT: &str = "partition record";
    Ok(PartitionRecord {
        thread_id: key.thread_id.clone(),
        checkpoint_ns: key.checkpoint_ns.clone(),
        latest_checkpoint_id: hash.get("latest_checkpoint_id").cloned(),
        created_at: parse_timestamp(WHAT, field(hash, WHAT, "created_at")?)?,
        expire_at: parse_timestamp(WHAT, field(hash, WHAT, "expire_at")?)?,
    })
}

pub fn checkpoint(
    key: &ThreadKey,
    checkpoint_id: &str,
    hash: &Hash,
    writes: &Hash,
) -> Result<CheckpointTuple, StoreError> {
    const WHAT: &str = "checkpoint";
    let checkpoint: Value = decode_json(WHAT, field(hash, WHAT, "checkpoint")?)?;
    let metadata: CheckpointMetadata =
        decode_json("checkpoint metadata", field(hash, WHAT, "metadata")?)?;

    Ok(CheckpointTuple {
        key: key.latest().at(checkpoint_id),
        checkpoint,
        metadata,
        parent_key: hash
            .get("parent_checkpoint_id")
            .map(|parent| key.latest().at(parent)),
        pending_writes: pending_writes(writes)?,
        created_at: parse_timestamp(WHAT, field(hash, WHAT, "created_at")?)?,
        expire_at: parse_timestamp(WHAT, field(hash, WHAT, "expire_at")?)?,
    })
}

/// Writes ordered by task, then by index within the task.
pub fn pending_writes(hash: &Hash) -> Result<Vec<PendingWrite>, StoreError> {
    let mut writes = hash
        .values()
        .map(|raw| decode_json::<PendingWrite>("pending write", raw))
        .collect::<Result<Vec<_>, _>>()?;
    writes.sort_by(|a, b| (&a.task_id, a.index).cmp(&(&b.task_id, b.index)));
    Ok(writes)
}

pub fn profile(hash: &Hash) -> Result<ProfileItem, StoreError> {
    const WHAT: &str = "profile";
    let namespace: Namespace = decode_json("profile namespace", field(hash, WHAT, "namespace")?)?;
    Ok(ProfileItem {
        namespace,
        key: field(hash, WHAT, "key")?.to_string(),
        value: decode_json("profile value", field(hash, WHAT, "value")?)?,
        created_at: parse_timestamp(WHAT, field(hash, WHAT, "created_at")?)?,
        updated_at: parse_timestamp(WHAT, field(hash, WHAT, "updated_at")?)?,
    })
}
