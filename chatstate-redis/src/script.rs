use std::collections::HashMap;
use std::sync::Arc;

use fred::interfaces::LuaInterface;
use fred::prelude::*;
use fred::types::FromRedis;
use tokio::sync::RwLock;

use chatstate_core::StoreError;

use crate::error::map_redis_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Script {
    pub name: &'static str,
    pub body: &'static str,
}

/// Appends a checkpoint and moves the partition pointer in one step.
///
/// Replies `{'stale', newest}` without writing when the proposed id does not
/// sort after the newest stored id, otherwise `{'ok', partition_expire_at}`.
pub const PUT_CHECKPOINT: Script = Script {
    name: "put_checkpoint",
    body: r#"
-- KEYS[1] = partition hash
-- KEYS[2] = checkpoint hash
-- KEYS[3] = checkpoint id index
-- KEYS[4] = namespaces of the thread
-- ARGV[1] = checkpoint id
-- ARGV[2] = thread id
-- ARGV[3] = namespace
-- ARGV[4] = escaped namespace
-- ARGV[5] = parent checkpoint id ('' = none)
-- ARGV[6] = checkpoint JSON
-- ARGV[7] = metadata JSON
-- ARGV[8] = created_at
-- ARGV[9] = expire_at
-- ARGV[10] = expiry mode ('sliding' or 'fixed')
local newest = redis.call('ZREVRANGE', KEYS[3], 0, 0)
if newest[1] and newest[1] >= ARGV[1] then
  return {'stale', newest[1]}
end
if redis.call('EXISTS', KEYS[1]) == 0 or ARGV[10] == 'sliding' then
  redis.call('HSET', KEYS[1], 'created_at', ARGV[8], 'expire_at', ARGV[9])
end
redis.call('HSET', KEYS[1], 'thread_id', ARGV[2], 'checkpoint_ns', ARGV[3], 'latest_checkpoint_id', ARGV[1])
redis.call('HSET', KEYS[2], 'checkpoint_id', ARGV[1], 'checkpoint', ARGV[6], 'metadata', ARGV[7], 'created_at', ARGV[8], 'expire_at', ARGV[9])
if ARGV[5] ~= '' then
  redis.call('HSET', KEYS[2], 'parent_checkpoint_id', ARGV[5])
end
redis.call('ZADD', KEYS[3], 0, ARGV[1])
redis.call('SADD', KEYS[4], ARGV[4])
return {'ok', redis.call('HGET', KEYS[1], 'expire_at')}
"#,
};

/// Adds expiry entries, keeping an existing score when it is already lower
/// so a registered entry is never pushed past its record's `expire_at`.
pub const REGISTER_EXPIRY: Script = Script {
    name: "register_expiry",
    body: r#"
-- KEYS[1] = expiry index
-- ARGV = score, member, score, member, ...
for i = 1, #ARGV, 2 do
  local current = redis.call('ZSCORE', KEYS[1], ARGV[i + 1])
  if not current or tonumber(current) > tonumber(ARGV[i]) then
    redis.call('ZADD', KEYS[1], ARGV[i], ARGV[i + 1])
  end
end
return 1
"#,
};

/// Replies 0 when the checkpoint does not exist.
pub const PUT_WRITES: Script = Script {
    name: "put_writes",
    body: r#"
-- KEYS[1] = checkpoint hash
-- KEYS[2] = pending writes hash
-- ARGV = field, JSON, field, JSON, ...
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
for i = 1, #ARGV, 2 do
  redis.call('HSET', KEYS[2], ARGV[i], ARGV[i + 1])
end
return 1
"#,
};

pub const LIST_PAGE: Script = Script {
    name: "list_page",
    body: r#"
-- KEYS[1] = checkpoint id index
-- ARGV[1] = exclusive upper bound ('' = none)
-- ARGV[2] = page size
local max = '+'
if ARGV[1] ~= '' then
  max = '(' .. ARGV[1]
end
return redis.call('ZREVRANGEBYLEX', KEYS[1], max, '-', 'LIMIT', 0, tonumber(ARGV[2]))
"#,
};

/// Deletes every partition of a thread and replies with their escaped namespaces.
pub const DELETE_THREAD: Script = Script {
    name: "delete_thread",
    body: r#"
-- KEYS[1] = namespaces of the thread
-- ARGV[1] = thread key base
local namespaces = redis.call('SMEMBERS', KEYS[1])
for _, ns in ipairs(namespaces) do
  local partition = ARGV[1] .. ':ns:' .. ns
  local ids = redis.call('ZRANGE', partition .. ':index', 0, -1)
  for _, id in ipairs(ids) do
    redis.call('DEL', partition .. ':cp:' .. id, partition .. ':w:' .. id)
  end
  redis.call('DEL', partition, partition .. ':index')
end
redis.call('DEL', KEYS[1])
return namespaces
"#,
};

/// Replies -1 when the partition is still alive, 1 when deleted and 0 when
/// it was already gone.
pub const SWEEP_PARTITION: Script = Script {
    name: "sweep_partition",
    body: r#"
-- KEYS[1] = partition hash
-- KEYS[2] = checkpoint id index
-- KEYS[3] = namespaces of the thread
-- ARGV[1] = checkpoint key prefix
-- ARGV[2] = pending writes key prefix
-- ARGV[3] = escaped namespace
-- ARGV[4] = cutoff timestamp
local expire_at = redis.call('HGET', KEYS[1], 'expire_at')
if expire_at and expire_at > ARGV[4] then
  return -1
end
local ids = redis.call('ZRANGE', KEYS[2], 0, -1)
for _, id in ipairs(ids) do
  redis.call('DEL', ARGV[1] .. id, ARGV[2] .. id)
end
redis.call('DEL', KEYS[1], KEYS[2])
redis.call('SREM', KEYS[3], ARGV[3])
if expire_at then
  return 1
end
return 0
"#,
};

/// Replies -1 when the checkpoint is still alive, 1 when deleted and 0 when
/// it was already gone.
pub const SWEEP_CHECKPOINT: Script = Script {
    name: "sweep_checkpoint",
    body: r#"
-- KEYS[1] = checkpoint hash
-- KEYS[2] = pending writes hash
-- KEYS[3] = checkpoint id index
-- ARGV[1] = checkpoint id
-- ARGV[2] = cutoff timestamp
local expire_at = redis.call('HGET', KEYS[1], 'expire_at')
if expire_at and expire_at > ARGV[2] then
  return -1
end
redis.call('DEL', KEYS[1], KEYS[2])
redis.call('ZREM', KEYS[3], ARGV[1])
if expire_at then
  return 1
end
return 0
"#,
};

pub const EXPIRED_ENTRIES: Script = Script {
    name: "expired_entries",
    body: r#"
-- KEYS[1] = expiry index
-- ARGV[1] = cutoff score (epoch millis)
-- ARGV[2] = batch size
return redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
"#,
};

pub const THREAD_IDS: Script = Script {
    name: "thread_ids",
    body: r#"
-- KEYS[1] = thread index
return redis.call('ZREVRANGE', KEYS[1], 0, -1)
"#,
};

/// Replaces a profile document and replies with its original `created_at`.
pub const PUT_PROFILE: Script = Script {
    name: "put_profile",
    body: r#"
-- KEYS[1] = profile document hash
-- KEYS[2] = profile index
-- ARGV[1] = document id
-- ARGV[2] = namespace JSON
-- ARGV[3] = key
-- ARGV[4] = value JSON
-- ARGV[5] = now
redis.call('HSETNX', KEYS[1], 'created_at', ARGV[5])
redis.call('HSET', KEYS[1], 'namespace', ARGV[2], 'key', ARGV[3], 'value', ARGV[4], 'updated_at', ARGV[5])
redis.call('ZADD', KEYS[2], 0, ARGV[1])
return redis.call('HGET', KEYS[1], 'created_at')
"#,
};

pub const DELETE_PROFILE: Script = Script {
    name: "delete_profile",
    body: r#"
-- KEYS[1] = profile document hash
-- KEYS[2] = profile index
-- ARGV[1] = document id
redis.call('DEL', KEYS[1])
return redis.call('ZREM', KEYS[2], ARGV[1])
"#,
};

/// Document ids are ASCII, so `prefix .. '\255'` bounds every id starting
/// with `prefix`.
pub const PROFILE_PAGE: Script = Script {
    name: "profile_page",
    body: r#"
-- KEYS[1] = profile index
-- ARGV[1] = document id prefix
-- ARGV[2] = exclusive lower bound ('' = none)
-- ARGV[3] = page size
local min = '-'
local max = '+'
if ARGV[1] ~= '' then
  min = '[' .. ARGV[1]
  max = '[' .. ARGV[1] .. '\255'
end
if ARGV[2] ~= '' then
  min = '(' .. ARGV[2]
end
return redis.call('ZRANGEBYLEX', KEYS[1], min, max, 'LIMIT', 0, tonumber(ARGV[3]))
"#,
};

pub const ALL_SCRIPTS: [Script; 12] = [
    PUT_CHECKPOINT,
    REGISTER_EXPIRY,
    PUT_WRITES,
    LIST_PAGE,
    DELETE_THREAD,
    SWEEP_PARTITION,
    SWEEP_CHECKPOINT,
    EXPIRED_ENTRIES,
    THREAD_IDS,
    PUT_PROFILE,
    DELETE_PROFILE,
    PROFILE_PAGE,
];

/// SHA1 of every loaded script, reloaded when the server forgets one.
#[derive(Clone, Default)]
pub struct ScriptCache {
    shas: Arc<RwLock<HashMap<&'static str, String>>>,
}

impl ScriptCache {
    pub async fn preload(&self, client: &RedisClient) -> Result<(), RedisError> {
        for script in ALL_SCRIPTS {
            self.load(client, script).await?;
        }
        Ok(())
    }

    async fn load(&self, client: &RedisClient, script: Script) -> Result<String, RedisError> {
        let sha = client.script_load::<String, _>(script.body).await?;
        self.shas.write().await.insert(script.name, sha.clone());
        Ok(sha)
    }

    pub async fn eval<R>(
        &self,
        client: &RedisClient,
        script: Script,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> Result<R, StoreError>
    where
        R: FromRedis + Send,
    {
        let cached = self.shas.read().await.get(script.name).cloned();
        let sha = match cached {
            Some(sha) => sha,
            None => self.load(client, script).await.map_err(map_redis_error)?,
        };

        match client
            .evalsha::<R, _, _, _>(sha, keys.clone(), args.clone())
            .await
        {
            Ok(reply) => Ok(reply),
            Err(error) if error.to_string().to_ascii_uppercase().contains("NOSCRIPT") => {
                tracing::debug!(script = script.name, "script cache flushed, reloading");
                let sha = self.load(client, script).await.map_err(map_redis_error)?;
                client
                    .evalsha::<R, _, _, _>(sha, keys, args)
                    .await
                    .map_err(map_redis_error)
            }
            Err(error) => Err(map_redis_error(error)),
        }
    }
}
