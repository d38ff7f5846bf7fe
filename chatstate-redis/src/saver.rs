use chrono::{DateTime, Utc};
use fred::interfaces::{SetsInterface, SortedSetsInterface};
use tracing::Instrument;

use chatstate_core::checkpoint::validate_thread_id;
use chatstate_core::namespace::{escape_component, unescape_component};
use chatstate_core::page::{paginate, Window};
use chatstate_core::{
    encode_json, format_timestamp, parse_timestamp, CheckpointMetadata, CheckpointSaver,
    CheckpointStream, CheckpointTuple, ListOptions, PartitionRecord, PendingWrite, StoreError,
    ThreadKey, Value,
};

use crate::keys::{safe_checkpoint_id, ExpiryEntry, PartitionKeys};
use crate::script::{DELETE_THREAD, PUT_CHECKPOINT, PUT_WRITES, REGISTER_EXPIRY, THREAD_IDS};
use crate::{record, score, RedisDatabase};

/// Attempts at allocating an id above the stored history before giving up.
const PUT_ATTEMPTS: usize = 3;

enum PutOutcome {
    Stored(ThreadKey),
    /// Another writer stored a greater id; carries the newest stored id.
    Stale(String),
}

#[derive(Clone, Debug)]
pub struct RedisCheckpointSaver {
    pub(crate) db: RedisDatabase,
}

impl RedisCheckpointSaver {
    pub fn new(db: RedisDatabase) -> Self {
        Self { db }
    }

    /// Thread ids with stored checkpoints, most recently written first.
    pub async fn thread_ids(&self) -> Result<Vec<String>, StoreError> {
        self.db
            .eval(THREAD_IDS, vec![self.db.keys.threads()], Vec::new())
            .await
    }

    /// Namespaces of a thread that hold a partition, in no particular order.
    pub async fn namespaces(&self, thread_id: &str) -> Result<Vec<String>, StoreError> {
        validate_thread_id(thread_id)?;
        let escaped: Vec<String> = self
            .db
            .run(
                self.db
                    .client
                    .smembers::<Vec<String>, _>(self.db.keys.namespaces(thread_id)),
            )
            .await?;
        escaped
            .iter()
            .map(|escaped| unescape_component(escaped))
            .collect()
    }

    pub(crate) async fn load_tuple(
        &self,
        key: &ThreadKey,
        keys: &PartitionKeys,
        checkpoint_id: &str,
    ) -> Result<Option<CheckpointTuple>, StoreError> {
        let hash = self.db.hgetall(&keys.checkpoint(checkpoint_id)).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        let writes = self.db.hgetall(&keys.writes(checkpoint_id)).await?;
        record::checkpoint(key, checkpoint_id, &hash, &writes).map(Some)
    }

    async fn latest_tuple(
        &self,
        key: &ThreadKey,
        keys: &PartitionKeys,
    ) -> Result<Option<CheckpointTuple>, StoreError> {
        let partition = self.db.hgetall(&keys.partition).await?;
        let Some(latest) = partition.get("latest_checkpoint_id") else {
            return Ok(None);
        };
        if let Some(tuple) = self.load_tuple(key, keys, latest).await? {
            return Ok(Some(tuple));
        }

        tracing::warn!(
            thread_id = %key.thread_id,
            checkpoint_id = %latest,
            "latest pointer names a missing checkpoint, using newest stored"
        );
        match self.id_page(keys, None, 1).await?.first() {
            Some(newest) => self.load_tuple(key, keys, newest).await,
            None => Ok(None),
        }
    }

    async fn put_with_retries(
        &self,
        key: &ThreadKey,
        keys: &PartitionKeys,
        checkpoint: &str,
        metadata: &str,
    ) -> Result<ThreadKey, StoreError> {
        let mut after = key.checkpoint_id.clone();
        for attempt in 1..=PUT_ATTEMPTS {
            match self
                .put_once(key, keys, checkpoint, metadata, after.as_deref())
                .await?
            {
                PutOutcome::Stored(stored) => return Ok(stored),
                PutOutcome::Stale(newest) => {
                    tracing::debug!(
                        attempt,
                        newest = %newest,
                        "checkpoint id behind stored history, regenerating"
                    );
                    after = Some(newest);
                }
            }
        }
        Err(StoreError::transient(format!(
            "no checkpoint id above the stored history after {PUT_ATTEMPTS} attempts"
        )))
    }

    async fn put_once(
        &self,
        key: &ThreadKey,
        keys: &PartitionKeys,
        checkpoint: &str,
        metadata: &str,
        after: Option<&str>,
    ) -> Result<PutOutcome, StoreError> {
        let now = Utc::now();
        let policy = self.db.config.ttl_policy();
        let stamp = policy.stamp(now);
        let id = self.db.ids.next_id(now, after);
        self.register_put(keys, &id, stamp.expire_at).await?;

        let reply: Vec<String> = self
            .db
            .eval(
                PUT_CHECKPOINT,
                vec![
                    keys.partition.clone(),
                    keys.checkpoint(&id),
                    keys.index.clone(),
                    keys.namespaces.clone(),
                ],
                vec![
                    id.clone(),
                    key.thread_id.clone(),
                    key.checkpoint_ns.clone(),
                    keys.escaped_ns.clone(),
                    key.checkpoint_id.clone().unwrap_or_default(),
                    checkpoint.to_string(),
                    metadata.to_string(),
                    format_timestamp(stamp.created_at),
                    format_timestamp(stamp.expire_at),
                    policy.mode().to_string(),
                ],
            )
            .await?;

        match reply.as_slice() {
            [status, partition_expire_at] if status == "ok" => {
                let partition_expire_at =
                    parse_timestamp("partition record", partition_expire_at)?;
                self.index_put(keys, &id, stamp.expire_at, partition_expire_at)
                    .await;
                Ok(PutOutcome::Stored(key.latest().at(id)))
            }
            [status, newest] if status == "stale" => Ok(PutOutcome::Stale(newest.clone())),
            other => Err(StoreError::serialization(
                "put_checkpoint reply",
                format!("{other:?}"),
            )),
        }
    }

    async fn delete_thread_keys(&self, thread_id: &str) -> Result<(), StoreError> {
        let escaped_namespaces: Vec<String> = self
            .db
            .eval(
                DELETE_THREAD,
                vec![self.db.keys.namespaces(thread_id)],
                vec![self.db.keys.thread_base(thread_id)],
            )
            .await?;

        let mut members = Vec::with_capacity(escaped_namespaces.len());
        for escaped in &escaped_namespaces {
            let entry = ExpiryEntry::Partition {
                thread_id: thread_id.to_string(),
                checkpoint_ns: unescape_component(escaped)?,
            };
            members.push(entry.member());
        }
        if !members.is_empty() {
            if let Err(error) = self
                .db
                .run(self.db.client.zrem::<i64, _, _>(self.db.keys.expiry(), members))
                .await
            {
                tracing::warn!(error = %error, "failed to prune expiry index");
            }
        }
        if let Err(error) = self
            .db
            .run(
                self.db
                    .client
                    .zrem::<i64, _, _>(self.db.keys.threads(), thread_id.to_string()),
            )
            .await
        {
            tracing::warn!(error = %error, "failed to prune thread index");
        }

        tracing::debug!(partitions = escaped_namespaces.len(), "deleted thread");
        Ok(())
    }

    /// Enters a put into the thread and expiry indexes before its records
    /// exist, so a put interrupted after the script still gets swept.
    /// Entries left by a put that never landed are dropped by the sweep.
    async fn register_put(
        &self,
        keys: &PartitionKeys,
        checkpoint_id: &str,
        expire_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let partition = ExpiryEntry::Partition {
            thread_id: keys.thread_id.clone(),
            checkpoint_ns: keys.checkpoint_ns.clone(),
        };
        let checkpoint = ExpiryEntry::Checkpoint {
            thread_id: keys.thread_id.clone(),
            checkpoint_ns: keys.checkpoint_ns.clone(),
            checkpoint_id: checkpoint_id.to_string(),
        };
        let expire_score = score(expire_at).to_string();

        self.db
            .eval::<i64>(
                REGISTER_EXPIRY,
                vec![self.db.keys.expiry()],
                vec![
                    expire_score.clone(),
                    partition.member(),
                    expire_score,
                    checkpoint.member(),
                ],
            )
            .await?;
        self.db
            .run(self.db.client.zadd::<(), _, _>(
                self.db.keys.threads(),
                None,
                None,
                false,
                false,
                vec![(score(Utc::now()), keys.thread_id.clone())],
            ))
            .await
    }

    /// Rescores the entries of a stored put with the exact stamps it landed with.
    async fn index_put(
        &self,
        keys: &PartitionKeys,
        checkpoint_id: &str,
        checkpoint_expire_at: DateTime<Utc>,
        partition_expire_at: DateTime<Utc>,
    ) {
        let partition = ExpiryEntry::Partition {
            thread_id: keys.thread_id.clone(),
            checkpoint_ns: keys.checkpoint_ns.clone(),
        };
        let checkpoint = ExpiryEntry::Checkpoint {
            thread_id: keys.thread_id.clone(),
            checkpoint_ns: keys.checkpoint_ns.clone(),
            checkpoint_id: checkpoint_id.to_string(),
        };

        self.db
            .advise_index(
                self.db.keys.expiry(),
                vec![
                    (score(partition_expire_at), partition.member()),
                    (score(checkpoint_expire_at), checkpoint.member()),
                ],
            )
            .await;
        self.db
            .advise_index(
                self.db.keys.threads(),
                vec![(score(Utc::now()), keys.thread_id.clone())],
            )
            .await;
    }
}

#[async_trait::async_trait]
impl CheckpointSaver for RedisCheckpointSaver {
    async fn put(
        &self,
        key: &ThreadKey,
        checkpoint: Value,
        metadata: CheckpointMetadata,
    ) -> Result<ThreadKey, StoreError> {
        key.validate()?;
        metadata.validate()?;
        if let Some(parent) = &key.checkpoint_id {
            safe_checkpoint_id(parent)?;
        }
        let keys = self.db.keys.partition(key);
        let checkpoint = encode_json("checkpoint", &checkpoint)?;
        let metadata = encode_json("checkpoint metadata", &metadata)?;

        let span = tracing::info_span!(
            "redis_put_checkpoint",
            thread_id = %key.thread_id,
            checkpoint_ns = %key.checkpoint_ns
        );
        self.put_with_retries(key, &keys, &checkpoint, &metadata)
            .instrument(span)
            .await
    }

    async fn put_writes(
        &self,
        key: &ThreadKey,
        writes: Vec<(String, Value)>,
        task_id: &str,
    ) -> Result<(), StoreError> {
        let checkpoint_id = safe_checkpoint_id(key.require_checkpoint_id()?)?;
        if task_id.is_empty() {
            return Err(StoreError::validation("task_id must not be empty"));
        }
        let keys = self.db.keys.partition(key);
        let task_field = escape_component(task_id);

        let mut args = Vec::with_capacity(writes.len() * 2);
        for (index, (channel, value)) in writes.into_iter().enumerate() {
            let write = PendingWrite {
                task_id: task_id.to_string(),
                index,
                channel,
                value,
            };
            args.push(format!("{task_field}|{index}"));
            args.push(encode_json("pending write", &write)?);
        }

        let stored: i64 = self
            .db
            .eval(
                PUT_WRITES,
                vec![keys.checkpoint(checkpoint_id), keys.writes(checkpoint_id)],
                args,
            )
            .await?;
        if stored == 0 {
            return Err(StoreError::validation(format!(
                "checkpoint '{checkpoint_id}' does not exist in thread '{}'",
                key.thread_id
            )));
        }
        Ok(())
    }

    async fn get_tuple(&self, key: &ThreadKey) -> Result<Option<CheckpointTuple>, StoreError> {
        key.validate()?;
        let keys = self.db.keys.partition(key);
        match key.checkpoint_id.as_deref() {
            Some(checkpoint_id) => {
                self.load_tuple(key, &keys, safe_checkpoint_id(checkpoint_id)?)
                    .await
            }
            None => self.latest_tuple(key, &keys).await,
        }
    }

    fn list<'a>(&'a self, key: &'a ThreadKey, options: ListOptions) -> CheckpointStream<'a> {
        let ListOptions {
            filter,
            before,
            limit,
        } = options;
        paginate(
            before,
            self.db.config.list_page_size(),
            Window { offset: 0, limit },
            move |tuple: &CheckpointTuple| tuple.metadata.matches(&filter),
            move |before, size| self.list_page(key, before, size),
        )
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<(), StoreError> {
        validate_thread_id(thread_id)?;
        let span = tracing::info_span!("redis_delete_thread", thread_id = %thread_id);
        self.delete_thread_keys(thread_id)
            .instrument(span)
            .await
    }

    async fn get_partition(&self, key: &ThreadKey) -> Result<Option<PartitionRecord>, StoreError> {
        key.validate()?;
        let keys = self.db.keys.partition(key);
        let hash = self.db.hgetall(&keys.partition).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        let mut partition = record::partition(key, &hash)?;
        // The pointer outlives its checkpoint once the sweep drops it.
        partition.latest_checkpoint_id = self.id_page(&keys, None, 1).await?.into_iter().next();
        Ok(Some(partition))
    }
}
