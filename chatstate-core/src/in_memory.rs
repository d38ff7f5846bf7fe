//! Process-local backends for tests and single-process deployments.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::checkpoint::{
    validate_thread_id, CheckpointMetadata, CheckpointSaver, CheckpointStream, CheckpointTuple,
    ListOptions, PartitionRecord, PendingWrite, ThreadKey,
};
use crate::config::DEFAULT_LIST_PAGE_SIZE;
use crate::id::CheckpointIdGenerator;
use crate::page::{paginate, Page, Window};
use crate::profile::{validate_address, ProfileItem, ProfileStore, ProfileStream, SearchQuery};
use crate::sweeper::{ExpirySweep, SweepReport};
use crate::ttl::{Stamp, TtlPolicy};
use crate::{Namespace, ProfileValue, StoreError, Value};

type PartitionId = (String, String);

#[derive(Debug, Clone)]
struct StoredCheckpoint {
    checkpoint: Value,
    metadata: CheckpointMetadata,
    parent_id: Option<String>,
    stamp: Stamp,
}

#[derive(Debug)]
struct PartitionState {
    stamp: Stamp,
    latest: Option<String>,
    checkpoints: BTreeMap<String, StoredCheckpoint>,
    writes: BTreeMap<String, BTreeMap<(String, usize), PendingWrite>>,
}

impl PartitionState {
    fn new(stamp: Stamp) -> Self {
        Self {
            stamp,
            latest: None,
            checkpoints: BTreeMap::new(),
            writes: BTreeMap::new(),
        }
    }

    fn latest_id(&self) -> Option<&str> {
        match &self.latest {
            Some(id) if self.checkpoints.contains_key(id) => Some(id),
            Some(id) => {
                tracing::warn!(
                    checkpoint_id = %id,
                    "latest pointer names a missing checkpoint, using newest stored"
                );
                self.checkpoints.keys().next_back().map(String::as_str)
            }
            None => self.checkpoints.keys().next_back().map(String::as_str),
        }
    }

    fn tuple(&self, key: &ThreadKey, id: &str, stored: &StoredCheckpoint) -> CheckpointTuple {
        let pending_writes = self
            .writes
            .get(id)
            .map(|writes| writes.values().cloned().collect())
            .unwrap_or_default();

        CheckpointTuple {
            key: key.latest().at(id),
            checkpoint: stored.checkpoint.clone(),
            metadata: stored.metadata.clone(),
            parent_key: stored.parent_id.as_ref().map(|parent| key.latest().at(parent)),
            pending_writes,
            created_at: stored.stamp.created_at,
            expire_at: stored.stamp.expire_at,
        }
    }
}

fn partition_id(key: &ThreadKey) -> PartitionId {
    (key.thread_id.clone(), key.checkpoint_ns.clone())
}

#[derive(Clone)]
pub struct InMemoryCheckpointSaver {
    partitions: Arc<RwLock<BTreeMap<PartitionId, PartitionState>>>,
    policy: TtlPolicy,
    ids: Arc<CheckpointIdGenerator>,
    page_size: usize,
}

impl Default for InMemoryCheckpointSaver {
    fn default() -> Self {
        Self::new(TtlPolicy::default())
    }
}

impl InMemoryCheckpointSaver {
    pub fn new(policy: TtlPolicy) -> Self {
        Self {
            partitions: Arc::default(),
            policy,
            ids: Arc::new(CheckpointIdGenerator::new()),
            page_size: DEFAULT_LIST_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn policy(&self) -> TtlPolicy {
        self.policy
    }

    /// Thread ids with at least one partition, in id order.
    pub async fn thread_ids(&self) -> Vec<String> {
        let partitions = self.partitions.read().await;
        let mut ids: Vec<String> = partitions.keys().map(|(thread, _)| thread.clone()).collect();
        ids.dedup();
        ids
    }

    async fn put_at(
        &self,
        key: &ThreadKey,
        checkpoint: Value,
        metadata: CheckpointMetadata,
        now: DateTime<Utc>,
    ) -> Result<ThreadKey, StoreError> {
        key.validate()?;
        metadata.validate()?;
        let record_stamp = self.policy.stamp(now);

        let mut partitions = self.partitions.write().await;
        let partition = match partitions.entry(partition_id(key)) {
            Entry::Occupied(entry) => {
                let partition = entry.into_mut();
                partition.stamp = self.policy.partition_stamp(Some(partition.stamp), now);
                partition
            }
            Entry::Vacant(entry) => entry.insert(PartitionState::new(record_stamp)),
        };

        let newest = partition.checkpoints.keys().next_back().map(String::as_str);
        let id = self.ids.next_id(now, newest.max(key.checkpoint_id.as_deref()));

        partition.checkpoints.insert(
            id.clone(),
            StoredCheckpoint {
                checkpoint,
                metadata,
                parent_id: key.checkpoint_id.clone(),
                stamp: record_stamp,
            },
        );
        partition.latest = Some(id.clone());

        tracing::debug!(
            thread_id = %key.thread_id,
            checkpoint_ns = %key.checkpoint_ns,
            checkpoint_id = %id,
            "stored checkpoint"
        );
        Ok(key.latest().at(id))
    }

    async fn list_page(
        &self,
        key: &ThreadKey,
        before: Option<String>,
        size: usize,
    ) -> Result<Page<CheckpointTuple>, StoreError> {
        key.validate()?;
        let partitions = self.partitions.read().await;
        let Some(partition) = partitions.get(&partition_id(key)) else {
            return Ok(Page::empty());
        };

        let upper = match &before {
            Some(before) => Bound::Excluded(before.as_str()),
            None => Bound::Unbounded,
        };
        let items = partition
            .checkpoints
            .range::<str, _>((Bound::Unbounded, upper))
            .rev()
            .take(size)
            .map(|(id, stored)| partition.tuple(key, id, stored))
            .collect();

        Ok(Page::from_batch(items, size, |tuple: &CheckpointTuple| {
            tuple.checkpoint_id().to_string()
        }))
    }
}

#[async_trait::async_trait]
impl CheckpointSaver for InMemoryCheckpointSaver {
    async fn put(
        &self,
        key: &ThreadKey,
        checkpoint: Value,
        metadata: CheckpointMetadata,
    ) -> Result<ThreadKey, StoreError> {
        self.put_at(key, checkpoint, metadata, Utc::now()).await
    }

    async fn put_writes(
        &self,
        key: &ThreadKey,
        writes: Vec<(String, Value)>,
        task_id: &str,
    ) -> Result<(), StoreError> {
        let checkpoint_id = key.require_checkpoint_id()?;
        if task_id.is_empty() {
            return Err(StoreError::validation("task_id must not be empty"));
        }

        let mut partitions = self.partitions.write().await;
        let partition = partitions
            .get_mut(&partition_id(key))
            .filter(|partition| partition.checkpoints.contains_key(checkpoint_id))
            .ok_or_else(|| {
                StoreError::validation(format!(
                    "checkpoint '{checkpoint_id}' does not exist in thread '{}'",
                    key.thread_id
                ))
            })?;

        let stored = partition.writes.entry(checkpoint_id.to_string()).or_default();
        for (index, (channel, value)) in writes.into_iter().enumerate() {
            stored.insert(
                (task_id.to_string(), index),
                PendingWrite {
                    task_id: task_id.to_string(),
                    index,
                    channel,
                    value,
                },
            );
        }
        Ok(())
    }

    async fn get_tuple(&self, key: &ThreadKey) -> Result<Option<CheckpointTuple>, StoreError> {
        key.validate()?;
        let partitions = self.partitions.read().await;
        let Some(partition) = partitions.get(&partition_id(key)) else {
            return Ok(None);
        };

        let id = match key.checkpoint_id.as_deref() {
            Some(id) => id,
            None => match partition.latest_id() {
                Some(id) => id,
                None => return Ok(None),
            },
        };
        Ok(partition
            .checkpoints
            .get(id)
            .map(|stored| partition.tuple(key, id, stored)))
    }

    fn list<'a>(&'a self, key: &'a ThreadKey, options: ListOptions) -> CheckpointStream<'a> {
        let ListOptions {
            filter,
            before,
            limit,
        } = options;
        paginate(
            before,
            self.page_size,
            Window { offset: 0, limit },
            move |tuple: &CheckpointTuple| tuple.metadata.matches(&filter),
            move |before, size| self.list_page(key, before, size),
        )
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<(), StoreError> {
        validate_thread_id(thread_id)?;
        let mut partitions = self.partitions.write().await;
        partitions.retain(|(thread, _), _| thread != thread_id);
        Ok(())
    }

    async fn get_partition(&self, key: &ThreadKey) -> Result<Option<PartitionRecord>, StoreError> {
        key.validate()?;
        let partitions = self.partitions.read().await;
        Ok(partitions.get(&partition_id(key)).map(|partition| PartitionRecord {
            thread_id: key.thread_id.clone(),
            checkpoint_ns: key.checkpoint_ns.clone(),
            latest_checkpoint_id: partition.latest_id().map(str::to_string),
            created_at: partition.stamp.created_at,
            expire_at: partition.stamp.expire_at,
        }))
    }
}

#[async_trait::async_trait]
impl ExpirySweep for InMemoryCheckpointSaver {
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let mut partitions = self.partitions.write().await;
        let mut report = SweepReport::default();

        partitions.retain(|_, partition| {
            if partition.stamp.is_expired(now) {
                report.partitions += 1;
                return false;
            }
            let before = partition.checkpoints.len();
            partition
                .checkpoints
                .retain(|_, stored| !stored.stamp.is_expired(now));
            let alive = &partition.checkpoints;
            partition.writes.retain(|id, _| alive.contains_key(id));
            report.checkpoints += before - partition.checkpoints.len();
            true
        });

        Ok(report)
    }
}

#[derive(Clone)]
pub struct InMemoryProfileStore {
    documents: Arc<RwLock<BTreeMap<String, ProfileItem>>>,
    page_size: usize,
}

impl Default for InMemoryProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self {
            documents: Arc::default(),
            page_size: DEFAULT_LIST_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn search_page(
        &self,
        prefix: &Namespace,
        after: Option<String>,
        size: usize,
    ) -> Result<Page<ProfileItem>, StoreError> {
        prefix.validate_prefix()?;
        let id_prefix = prefix.id_prefix();
        let lower = match &after {
            Some(after) => Bound::Excluded(after.as_str()),
            None => Bound::Included(id_prefix.as_str()),
        };

        let documents = self.documents.read().await;
        let items = documents
            .range::<str, _>((lower, Bound::Unbounded))
            .take_while(|(id, _)| id.starts_with(&id_prefix))
            .take(size)
            .map(|(_, item)| item.clone())
            .collect();

        Ok(Page::from_batch(items, size, |item: &ProfileItem| {
            item.namespace.document_id(&item.key)
        }))
    }
}

#[async_trait::async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn get(
        &self,
        namespace: &Namespace,
        key: &str,
    ) -> Result<Option<ProfileItem>, StoreError> {
        validate_address(namespace, key)?;
        let documents = self.documents.read().await;
        Ok(documents.get(&namespace.document_id(key)).cloned())
    }

    async fn put(
        &self,
        namespace: &Namespace,
        key: &str,
        value: ProfileValue,
    ) -> Result<ProfileItem, StoreError> {
        validate_address(namespace, key)?;
        let now = Utc::now();
        let mut documents = self.documents.write().await;
        let id = namespace.document_id(key);
        let created_at = documents.get(&id).map_or(now, |existing| existing.created_at);

        let item = ProfileItem {
            namespace: namespace.clone(),
            key: key.to_string(),
            value,
            created_at,
            updated_at: now,
        };
        documents.insert(id, item.clone());
        Ok(item)
    }

    async fn delete(&self, namespace: &Namespace, key: &str) -> Result<(), StoreError> {
        validate_address(namespace, key)?;
        let mut documents = self.documents.write().await;
        documents.remove(&namespace.document_id(key));
        Ok(())
    }

    fn search<'a>(&'a self, prefix: &'a Namespace, query: SearchQuery) -> ProfileStream<'a> {
        let window = query.window();
        paginate(
            None,
            self.page_size,
            window,
            move |item: &ProfileItem| query.accepts(item),
            move |after, size| self.search_page(prefix, after, size),
        )
    }
}
