mod error;
mod history;
mod keys;
mod profile;
mod record;
mod saver;
mod script;
mod sweep;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fred::interfaces::HashesInterface;
use fred::prelude::*;
use fred::types::FromRedis;

use chatstate_core::{with_timeout, CheckpointIdGenerator, StoreConfig, StoreError};

use crate::keys::KeyLayout;
use crate::script::{Script, ScriptCache};

pub use error::RedisStoreError;
pub use keys::{ExpiryEntry, KeyLayout as RedisKeyLayout, PartitionKeys};
pub use profile::RedisProfileStore;
pub use saver::RedisCheckpointSaver;

/// One Redis connection shared by the checkpoint saver and the profile store.
///
/// Cloning is cheap; clones share the client, the script cache and the
/// checkpoint id generator.
#[derive(Clone)]
pub struct RedisDatabase {
    client: RedisClient,
    config: Arc<StoreConfig>,
    keys: Arc<KeyLayout>,
    scripts: ScriptCache,
    ids: Arc<CheckpointIdGenerator>,
}

impl std::fmt::Debug for RedisDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDatabase")
            .field("config", &self.config)
            .finish()
    }
}

impl RedisDatabase {
    pub async fn connect(config: StoreConfig) -> Result<Self, RedisStoreError> {
        let redis_config = RedisConfig::from_url(config.url())
            .map_err(|error| RedisStoreError::InvalidUrl(error.to_string()))?;
        let client = RedisClient::new(redis_config, None, None, None);
        client
            .init()
            .await
            .map_err(|error| RedisStoreError::Connect(error.to_string()))?;

        let database = Self::from_client(client, config);
        database
            .scripts
            .preload(&database.client)
            .await
            .map_err(|error| RedisStoreError::ScriptLoad(error.to_string()))?;

        tracing::debug!(config = ?database.config, "connected to redis");
        Ok(database)
    }

    /// Wraps a client the caller has already initialised.
    pub fn from_client(client: RedisClient, config: StoreConfig) -> Self {
        Self {
            client,
            keys: Arc::new(KeyLayout::new(&config)),
            config: Arc::new(config),
            scripts: ScriptCache::default(),
            ids: Arc::new(CheckpointIdGenerator::new()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn checkpoint_saver(&self) -> RedisCheckpointSaver {
        RedisCheckpointSaver::new(self.clone())
    }

    pub fn profile_store(&self) -> RedisProfileStore {
        RedisProfileStore::new(self.clone())
    }

    pub async fn quit(&self) -> Result<(), StoreError> {
        self.run(self.client.quit()).await
    }

    /// Runs a client call under the configured operation timeout.
    pub(crate) async fn run<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, RedisError>>,
    {
        with_timeout(self.config.operation_timeout(), async {
            call.await.map_err(error::map_redis_error)
        })
        .await
    }

    pub(crate) async fn eval<R>(
        &self,
        script: Script,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> Result<R, StoreError>
    where
        R: FromRedis + Send,
    {
        with_timeout(
            self.config.operation_timeout(),
            self.scripts.eval(&self.client, script, keys, args),
        )
        .await
    }

    /// Empty when the key does not exist.
    pub(crate) async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.run(self.client.hgetall::<HashMap<String, String>, _>(key))
            .await
    }

    /// Adds or rescores members of an index without failing the caller.
    pub(crate) async fn advise_index(&self, index: String, members: Vec<(f64, String)>) {
        if members.is_empty() {
            return;
        }
        let result = self
            .run(
                self.client
                    .zadd::<(), _, _>(index.as_str(), None, None, false, false, members),
            )
            .await;
        if let Err(error) = result {
            tracing::warn!(index = %index, error = %error, "failed to update index");
        }
    }
}

/// Index score for a timestamp: epoch milliseconds rounded up, so an entry
/// scored from a live `expire_at` never falls at or below a cutoff taken
/// from an earlier instant.
pub(crate) fn score(at: DateTime<Utc>) -> f64 {
    let micros = at.timestamp_micros();
    let millis = micros.div_euclid(1000) + i64::from(micros.rem_euclid(1000) > 0);
    millis as f64
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn scores_round_up_to_the_next_millisecond() {
        let exact = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let partial = exact + chrono::Duration::microseconds(1);

        assert_eq!(score(exact), 1_700_000_000_000.0);
        assert_eq!(score(partial), 1_700_000_000_001.0);
        assert!(score(partial) > exact.timestamp_millis() as f64);
    }
}
