use chrono::{DateTime, Utc};
use fred::interfaces::{HashesInterface, KeysInterface, SortedSetsInterface};

use chatstate_core::{
    format_timestamp, parse_timestamp, ExpirySweep, StoreError, SweepReport,
};

use crate::keys::{safe_checkpoint_id, ExpiryEntry};
use crate::script::{EXPIRED_ENTRIES, SWEEP_CHECKPOINT, SWEEP_PARTITION};
use crate::{score, RedisCheckpointSaver};

/// Outcome reported by the sweep scripts.
const STILL_ALIVE: i64 = -1;
const DELETED: i64 = 1;

impl RedisCheckpointSaver {
    async fn sweep_entry(&self, entry: &ExpiryEntry, cutoff: &str) -> Result<i64, StoreError> {
        let keys = self.db.keys.partition(&entry.thread_key());
        match entry {
            ExpiryEntry::Partition { .. } => {
                self.db
                    .eval(
                        SWEEP_PARTITION,
                        vec![
                            keys.partition.clone(),
                            keys.index.clone(),
                            keys.namespaces.clone(),
                        ],
                        vec![
                            keys.checkpoint_prefix(),
                            keys.writes_prefix(),
                            keys.escaped_ns.clone(),
                            cutoff.to_string(),
                        ],
                    )
                    .await
            }
            ExpiryEntry::Checkpoint { checkpoint_id, .. } => {
                let checkpoint_id = safe_checkpoint_id(checkpoint_id)?;
                self.db
                    .eval(
                        SWEEP_CHECKPOINT,
                        vec![
                            keys.checkpoint(checkpoint_id),
                            keys.writes(checkpoint_id),
                            keys.index.clone(),
                        ],
                        vec![checkpoint_id.to_string(), cutoff.to_string()],
                    )
                    .await
            }
        }
    }

    /// Scores a live entry with its current `expire_at`, or drops it when the
    /// record no longer carries one.
    async fn rescore(&self, entry: &ExpiryEntry, member: &str) -> Result<(), StoreError> {
        let keys = self.db.keys.partition(&entry.thread_key());
        let hash_key = match entry {
            ExpiryEntry::Partition { .. } => keys.partition.clone(),
            ExpiryEntry::Checkpoint { checkpoint_id, .. } => keys.checkpoint(checkpoint_id),
        };
        let expire_at: Option<String> = self
            .db
            .run(self.db.client.hget::<Option<String>, _, _>(hash_key, "expire_at"))
            .await?;

        match expire_at.map(|raw| parse_timestamp("expiry timestamp", &raw)) {
            Some(Ok(expire_at)) => {
                self.db
                    .run(self.db.client.zadd::<(), _, _>(
                        self.db.keys.expiry(),
                        None,
                        None,
                        false,
                        false,
                        vec![(score(expire_at), member.to_string())],
                    ))
                    .await
            }
            _ => self.forget(member).await,
        }
    }

    /// Drops a thread from the thread index once its last partition is gone.
    ///
    /// A put racing this call re-adds the thread after its script runs.
    async fn prune_thread(&self, thread_id: &str) -> Result<(), StoreError> {
        let namespaces = self.db.keys.namespaces(thread_id);
        let remaining: i64 = self.db.run(self.db.client.exists::<i64, _>(namespaces)).await?;
        if remaining > 0 {
            return Ok(());
        }
        self.db
            .run(
                self.db
                    .client
                    .zrem::<i64, _, _>(self.db.keys.threads(), thread_id.to_string()),
            )
            .await?;
        tracing::debug!(thread_id = %thread_id, "thread has no partitions left");
        Ok(())
    }

    async fn forget(&self, member: &str) -> Result<(), StoreError> {
        self.db
            .run(
                self.db
                    .client
                    .zrem::<i64, _, _>(self.db.keys.expiry(), member.to_string()),
            )
            .await
            .map(|_| ())
    }
}

#[async_trait::async_trait]
impl ExpirySweep for RedisCheckpointSaver {
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let cutoff = format_timestamp(now);
        let cutoff_score = now.timestamp_millis().to_string();
        let batch = self.db.config.list_page_size();
        let mut report = SweepReport::default();

        // Every handled member is either removed or rescored above the
        // cutoff, so each batch makes progress.
        loop {
            let members: Vec<String> = self
                .db
                .eval(
                    EXPIRED_ENTRIES,
                    vec![self.db.keys.expiry()],
                    vec![cutoff_score.clone(), batch.to_string()],
                )
                .await?;

            for member in &members {
                let entry = match ExpiryEntry::parse(member) {
                    Ok(entry) => entry,
                    Err(error) => {
                        tracing::warn!(
                            member = %member,
                            error = %error,
                            "dropping unreadable expiry entry"
                        );
                        self.forget(member).await?;
                        continue;
                    }
                };

                match self.sweep_entry(&entry, &cutoff).await? {
                    STILL_ALIVE => self.rescore(&entry, member).await?,
                    outcome => {
                        match &entry {
                            ExpiryEntry::Partition { thread_id, .. } => {
                                if outcome == DELETED {
                                    report.partitions += 1;
                                }
                                self.prune_thread(thread_id).await?;
                            }
                            ExpiryEntry::Checkpoint { .. } if outcome == DELETED => {
                                report.checkpoints += 1;
                            }
                            ExpiryEntry::Checkpoint { .. } => {}
                        }
                        self.forget(member).await?;
                    }
                }
            }

            if members.len() < batch {
                break;
            }
        }

        if !report.is_empty() {
            tracing::info!(
                partitions = report.partitions,
                checkpoints = report.checkpoints,
                "swept expired checkpoint data"
            );
        }
        Ok(report)
    }
}
