use chatstate_core::page::Page;
use chatstate_core::{CheckpointTuple, StoreError, ThreadKey};

use crate::keys::PartitionKeys;
use crate::script::LIST_PAGE;
use crate::RedisCheckpointSaver;

impl RedisCheckpointSaver {
    /// Up to `count` checkpoint ids below `before`, newest first.
    pub(crate) async fn id_page(
        &self,
        keys: &PartitionKeys,
        before: Option<&str>,
        count: usize,
    ) -> Result<Vec<String>, StoreError> {
        self.db
            .eval(
                LIST_PAGE,
                vec![keys.index.clone()],
                vec![before.unwrap_or_default().to_string(), count.to_string()],
            )
            .await
    }

    pub(crate) async fn list_page(
        &self,
        key: &ThreadKey,
        before: Option<String>,
        count: usize,
    ) -> Result<Page<CheckpointTuple>, StoreError> {
        key.validate()?;
        let keys = self.db.keys.partition(key);
        let ids = self.id_page(&keys, before.as_deref(), count).await?;
        let next = if ids.len() < count {
            None
        } else {
            ids.last().cloned()
        };

        let mut items = Vec::with_capacity(ids.len());
        for id in &ids {
            // Swept between the index read and the hash read.
            let Some(tuple) = self.load_tuple(key, &keys, id).await? else {
                continue;
            };
            items.push(tuple);
        }

        tracing::debug!(
            thread_id = %key.thread_id,
            fetched = items.len(),
            "loaded checkpoint page"
        );
        Ok(Page { items, next })
    }
}
